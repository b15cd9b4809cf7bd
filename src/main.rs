use learnhub_session::{SessionConfig, SessionDeps, SessionEngine, SessionPhase};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "learnhub_session=debug".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = SessionConfig::from_env()?;
    info!(backend = %config.backend_url, session_path = %config.session_path.display(), "starting session engine");
    let deps = SessionDeps::init(config)?;
    let engine = SessionEngine::start(deps).await;

    if !engine.state().is_authenticated() {
        if let (Ok(email), Ok(password)) = (
            std::env::var("LEARNHUB_LOGIN_EMAIL"),
            std::env::var("LEARNHUB_LOGIN_PASSWORD"),
        ) {
            match engine.login(&email, &password).await {
                Ok(user) => info!(user_id = %user.id, role = ?user.role, "signed in"),
                Err(e) => warn!(error = %e, "sign-in failed"),
            }
        }
    }

    let mut updates = engine.subscribe();
    loop {
        {
            let state = updates.borrow_and_update();
            match (&state.phase, state.current_user()) {
                (SessionPhase::Authenticated, Some(user)) => info!(
                    user_id = %user.id,
                    email = %user.email,
                    role = ?user.role,
                    approval = ?user.approval_status,
                    "session active"
                ),
                (phase, _) => info!(?phase, "session state"),
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    error!("session engine stopped publishing");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}
