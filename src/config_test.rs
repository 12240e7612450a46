use super::*;
use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that mutate process env.
fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// # Safety
/// Caller must hold [`env_lock`].
unsafe fn clear_config_env() {
    unsafe {
        for key in [
            "SUPABASE_URL",
            "SUPABASE_ANON_KEY",
            "DATABASE_URL",
            "SESSION_INIT_TIMEOUT_SECS",
            "SESSION_SYNC_TIMEOUT_SECS",
            "AUTH_ACTION_TIMEOUT_SECS",
            "AUTH_RETRY_MAX",
            "AUTH_RETRY_BASE_DELAY_MS",
            "AUTH_AUTO_REFRESH",
            "SESSION_STORAGE_PATH",
            "APP_ENV",
            "SITE_URL_PROD",
            "SITE_URL_DEV",
        ] {
            std::env::remove_var(key);
        }
    }
}

/// # Safety
/// Same constraint as [`clear_config_env`].
unsafe fn set_required() {
    unsafe {
        std::env::set_var("SUPABASE_URL", "https://league.example.test/");
        std::env::set_var("SUPABASE_ANON_KEY", "anon-key");
    }
}

// =============================================================================
// from_env
// =============================================================================

#[test]
fn from_env_defaults() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        set_required();
    }

    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.supabase_url, "https://league.example.test");
    assert_eq!(cfg.supabase_anon_key, "anon-key");
    assert_eq!(cfg.database_url, None);
    assert_eq!(cfg.timeouts, SessionTimeouts::default());
    assert_eq!(cfg.timeouts.init, Duration::from_secs(DEFAULT_SESSION_INIT_TIMEOUT_SECS));
    assert_eq!(cfg.retry, RetryPolicy::default());
    assert!(cfg.auto_refresh);
    assert_eq!(cfg.session_storage_path, None);
    assert_eq!(cfg.site_url, DEFAULT_SITE_URL_DEV);

    unsafe { clear_config_env() };
}

#[test]
fn from_env_parses_overrides() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        set_required();
        std::env::set_var("DATABASE_URL", "postgres://localhost/league");
        std::env::set_var("SESSION_INIT_TIMEOUT_SECS", "3");
        std::env::set_var("SESSION_SYNC_TIMEOUT_SECS", "7");
        std::env::set_var("AUTH_ACTION_TIMEOUT_SECS", "20");
        std::env::set_var("AUTH_RETRY_MAX", "1");
        std::env::set_var("AUTH_RETRY_BASE_DELAY_MS", "250");
        std::env::set_var("AUTH_AUTO_REFRESH", "false");
        std::env::set_var("SESSION_STORAGE_PATH", "/tmp/league-session.json");
        std::env::set_var("APP_ENV", "production");
    }

    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/league"));
    assert_eq!(cfg.timeouts.init, Duration::from_secs(3));
    assert_eq!(cfg.timeouts.sync, Duration::from_secs(7));
    assert_eq!(cfg.timeouts.action, Duration::from_secs(20));
    assert_eq!(cfg.retry, RetryPolicy::new(1, Duration::from_millis(250)));
    assert!(!cfg.auto_refresh);
    assert_eq!(cfg.session_storage_path, Some(PathBuf::from("/tmp/league-session.json")));
    assert_eq!(cfg.site_url, DEFAULT_SITE_URL_PROD);

    unsafe { clear_config_env() };
}

#[test]
fn from_env_invalid_number_falls_back_to_default() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        set_required();
        std::env::set_var("SESSION_INIT_TIMEOUT_SECS", "soon");
    }

    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.timeouts.init, Duration::from_secs(DEFAULT_SESSION_INIT_TIMEOUT_SECS));

    unsafe { clear_config_env() };
}

#[test]
fn from_env_missing_url_is_error() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        std::env::set_var("SUPABASE_ANON_KEY", "anon-key");
    }

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Missing("SUPABASE_URL")));

    unsafe { clear_config_env() };
}

#[test]
fn from_env_missing_key_is_error() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        std::env::set_var("SUPABASE_URL", "https://league.example.test");
    }

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Missing("SUPABASE_ANON_KEY")));

    unsafe { clear_config_env() };
}

#[test]
fn from_env_bad_flag_is_error() {
    let _env = env_lock();
    unsafe {
        clear_config_env();
        set_required();
        std::env::set_var("AUTH_AUTO_REFRESH", "sometimes");
    }

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "AUTH_AUTO_REFRESH", .. }));

    unsafe { clear_config_env() };
}

// =============================================================================
// helpers
// =============================================================================

#[test]
fn parse_bool_accepts_common_spellings() {
    assert!(parse_bool("K", None).unwrap());
    assert!(parse_bool("K", Some(" TRUE ")).unwrap());
    assert!(parse_bool("K", Some("1")).unwrap());
    assert!(!parse_bool("K", Some("no")).unwrap());
    assert!(!parse_bool("K", Some("0")).unwrap());
}

#[test]
fn email_redirect_url_appends_callback() {
    let cfg = Config {
        supabase_url: "https://league.example.test".into(),
        supabase_anon_key: "k".into(),
        database_url: None,
        timeouts: SessionTimeouts::default(),
        retry: RetryPolicy::default(),
        auto_refresh: true,
        session_storage_path: None,
        site_url: "http://localhost:5173/".into(),
    };
    assert_eq!(cfg.email_redirect_url(), "http://localhost:5173/auth/callback?redirect_to=/dashboard");
}
