use std::sync::Arc;

use clap::{Parser, Subcommand};
use league_auth::config::Config;
use league_auth::provider::gotrue::GoTrueClient;
use league_auth::provider::{IdentityProvider, ProviderError};
use league_auth::services::session::{ActionError, SessionManager};
use league_auth::state::SessionSnapshot;
use league_auth::store::postgres::PgProfileStore;
use league_auth::store::{NewProfile, Profile, ProfileStore, ProfileUpdate, StoreError};
use league_auth::{config, db};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("provider client setup failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("database init failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{}", .0.user_message())]
    Action(#[from] ActionError),
}

#[derive(Parser, Debug)]
#[command(name = "league-auth", about = "League session coordinator CLI")]
struct Cli {
    /// Skip the background token refresh task.
    #[arg(long, default_value_t = false)]
    no_auto_refresh: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Establish the session and print every state change until Ctrl-C.
    Watch,
    /// Register a new account and create its profile.
    SignUp {
        email: String,
        password: String,
        #[arg(long, default_value = "")]
        nickname: String,
    },
    /// Sign in with email and password.
    SignIn { email: String, password: String },
    /// Email a one-time sign-in link.
    MagicLink {
        email: String,
        /// Create the account if it does not exist, using this nickname.
        #[arg(long)]
        sign_up_as: Option<String>,
    },
    /// Adopt the tokens from an email-link callback URL.
    Callback { access_token: String, refresh_token: String },
    /// Change the signed-in player's nickname and position.
    Profile {
        nickname: String,
        #[arg(long)]
        position: Option<String>,
    },
    /// Set the signed-in player's avatar URL, or remove it when omitted.
    Avatar { url: Option<String> },
    /// Sign out and forget the stored session.
    SignOut,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_env()?;

    let client = Arc::new(GoTrueClient::from_config(&config)?);
    let refresher = (config.auto_refresh && !cli.no_auto_refresh).then(|| client.spawn_auto_refresh());

    let store: Arc<dyn ProfileStore> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url).await?;
            Arc::new(PgProfileStore::new(pool, config.retry))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, profiles will not be persisted");
            Arc::new(NoProfileStore)
        }
    };
    let provider: Arc<dyn IdentityProvider> = client;
    let manager = SessionManager::from_config(provider, store, &config);

    let result = match cli.command {
        Command::Watch => {
            watch(&manager).await;
            Ok(())
        }
        Command::SignUp { email, password, nickname } => {
            let outcome = manager.sign_up(&email, &password, &nickname).await?;
            if outcome.session.is_some() {
                println!("signed up as {}", outcome.identity.id);
            } else {
                println!("signed up as {}; check your email to confirm", outcome.identity.id);
            }
            Ok(())
        }
        Command::SignIn { email, password } => {
            let session = manager.sign_in(&email, &password).await?;
            println!("signed in as {}", session.identity.id);
            Ok(())
        }
        Command::MagicLink { email, sign_up_as } => {
            match sign_up_as {
                Some(nickname) => manager.sign_up_with_magic_link(&email, &nickname).await?,
                None => manager.sign_in_with_magic_link(&email).await?,
            }
            println!("magic link sent to {email}");
            Ok(())
        }
        Command::Callback { access_token, refresh_token } => {
            let session = manager.set_session(&access_token, &refresh_token).await?;
            println!("signed in as {}", session.identity.id);
            Ok(())
        }
        Command::Profile { nickname, position } => {
            manager.initialize().await;
            let profile = manager
                .update_profile(&nickname, position.as_deref())
                .await?;
            println!("nickname is now {}", profile.nickname);
            Ok(())
        }
        Command::Avatar { url } => {
            manager.initialize().await;
            let profile = manager.update_avatar(url.as_deref()).await?;
            match profile.avatar {
                Some(avatar) => println!("avatar set to {avatar}"),
                None => println!("avatar removed"),
            }
            Ok(())
        }
        Command::SignOut => {
            manager.sign_out().await;
            println!("signed out");
            Ok(())
        }
    };

    manager.teardown();
    if let Some(refresher) = refresher {
        refresher.abort();
    }
    result
}

async fn watch(manager: &Arc<SessionManager>) {
    let mut rx = manager.subscribe_snapshots();
    manager.initialize().await;
    print_snapshot(&rx.borrow_and_update());

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                print_snapshot(&rx.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "could not render session snapshot"),
    }
}

/// Stand-in used when no database is configured. Every read fails, so the
/// session manager keeps identities but never adopts a profile.
struct NoProfileStore;

#[async_trait::async_trait]
impl ProfileStore for NoProfileStore {
    async fn get_by_id(&self, _id: Uuid) -> Result<Profile, StoreError> {
        Err(StoreError::Db(sqlx::Error::Configuration("DATABASE_URL not set".into())))
    }

    async fn insert(&self, _profile: &NewProfile) -> Result<Profile, StoreError> {
        Err(StoreError::Db(sqlx::Error::Configuration("DATABASE_URL not set".into())))
    }

    async fn update(&self, _id: Uuid, _update: &ProfileUpdate) -> Result<Profile, StoreError> {
        Err(StoreError::Db(sqlx::Error::Configuration("DATABASE_URL not set".into())))
    }
}
