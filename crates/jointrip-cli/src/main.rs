use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jointrip_core::api::SessionClient;
use jointrip_core::auth::{
    random_state, AuthError, AuthorizationCallback, CallbackFlow, CallbackPhase,
    FileTokenStore, OAuthFlowHandler, PendingAuthorization, SessionContext, SessionState,
    UserSnapshot,
};
use jointrip_core::config::{ClientConfig, ConfigLocator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "JoinTrip session CLI")]
struct Cli {
    /// Profile name for stored tokens (defaults to JOINTRIP_PROFILE or "default")
    #[arg(long, global = true)]
    profile: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
    /// User account details
    #[command(subcommand)]
    User(UserCommand),
    /// Raw authenticated API calls
    #[command(subcommand)]
    Api(ApiCommand),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Ask the backend for a provider authorization URL
    Url(UrlArgs),
    /// Complete login with the redirect URL (or its query string) from the provider
    Login(LoginArgs),
    /// Restore the stored session and report its state
    Status,
    /// Exchange the stored refresh token for a new access token
    Refresh,
    /// End the session and forget stored tokens
    Logout,
}

#[derive(Args, Debug)]
struct UrlArgs {
    /// Anti-forgery state to send; a random one is generated when omitted
    #[arg(long)]
    state: Option<String>,
    /// Open the authorization URL in the system browser
    #[arg(long)]
    open: bool,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Callback URL or query string containing `code` and `state`
    callback: String,
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Show the current authenticated user
    Me(MeArgs),
}

#[derive(Args, Debug)]
struct MeArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ApiCommand {
    /// GET a backend path with the stored session attached
    Get(GetArgs),
}

#[derive(Args, Debug)]
struct GetArgs {
    /// Path relative to the API base URL, e.g. `profile`
    path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let (context, pending_path) = build_context(cli.profile)?;

    match cli.command {
        Commands::Auth(AuthCommand::Url(args)) => auth_url(&context, &pending_path, args).await,
        Commands::Auth(AuthCommand::Login(args)) => {
            auth_login(&context, &pending_path, args).await
        }
        Commands::Auth(AuthCommand::Status) => auth_status(&context).await,
        Commands::Auth(AuthCommand::Refresh) => auth_refresh(&context).await,
        Commands::Auth(AuthCommand::Logout) => auth_logout(&context).await,
        Commands::User(UserCommand::Me(args)) => user_me(&context, args).await,
        Commands::Api(ApiCommand::Get(args)) => api_get(&context, args).await,
    }
}

/// Session context plus the file holding the outstanding authorization request.
fn build_context(profile: Option<String>) -> Result<(SessionContext<FileTokenStore>, PathBuf)> {
    let mut config = ClientConfig::from_env().context("invalid JOINTRIP_* configuration")?;
    if let Some(profile) = profile {
        config = config.with_profile(profile);
    }

    let locator = ConfigLocator::new().context("unable to locate configuration directory")?;
    let store = Arc::new(FileTokenStore::new(&locator, &config.profile));
    let pending_path = locator.pending_file(&config.profile);
    let client =
        SessionClient::new(&config, store).context("failed to build session HTTP client")?;
    let oauth = OAuthFlowHandler::new(&config).context("failed to build OAuth HTTP client")?;
    Ok((SessionContext::new(client, oauth), pending_path))
}

async fn auth_url(
    context: &SessionContext<FileTokenStore>,
    pending_path: &Path,
    args: UrlArgs,
) -> Result<()> {
    let state = args.state.unwrap_or_else(|| random_state(32));
    let pending = context
        .request_authorization_url(Some(&state))
        .await
        .context("failed to obtain authorization URL")?;
    pending
        .save(pending_path)
        .context("failed to remember the authorization request")?;

    println!("\nAuthorize the application by visiting:\n  {}\n", pending.url);
    println!("State: {}", pending.state);
    println!("Then run `jointrip auth login <redirect-url>` with the URL you are sent back to.");

    if args.open {
        open::that(pending.url.as_str())
            .map_err(|err| anyhow!("failed to launch system browser: {err}"))?;
    }
    Ok(())
}

async fn auth_login(
    context: &SessionContext<FileTokenStore>,
    pending_path: &Path,
    args: LoginArgs,
) -> Result<()> {
    let callback =
        AuthorizationCallback::parse(&args.callback).context("unrecognised callback input")?;
    let pending = PendingAuthorization::take(pending_path)
        .context("failed to load the outstanding authorization request")?;
    if pending.is_none() {
        eprintln!("No outstanding `jointrip auth url` request; state is left to the backend.");
    }

    let mut flow = CallbackFlow::new();
    match flow.run(context, &callback, pending).await? {
        CallbackPhase::Success(user) => {
            println!("Login succeeded.");
            render_user(user);
            Ok(())
        }
        CallbackPhase::Failed(AuthError::AuthorizationDenied(reason)) => bail!(
            "authentication was cancelled or failed ({reason}); run `jointrip auth url` to try again"
        ),
        CallbackPhase::Failed(AuthError::StateMismatch) => bail!(
            "the callback does not answer the last `jointrip auth url` request; run it again"
        ),
        CallbackPhase::Failed(AuthError::MissingCode) => {
            bail!("no authorization code received; run `jointrip auth url` to try again")
        }
        CallbackPhase::Failed(err) => bail!("login failed: {err}"),
        other => bail!("login did not complete: {other:?}"),
    }
}

async fn auth_status(context: &SessionContext<FileTokenStore>) -> Result<()> {
    match context.restore_from_storage().await {
        SessionState::Authenticated(user) => {
            println!("Authenticated.");
            render_user(&user);
        }
        SessionState::Unauthenticated => println!("Not logged in."),
        other => println!("Session state: {other:?}"),
    }
    Ok(())
}

async fn auth_refresh(context: &SessionContext<FileTokenStore>) -> Result<()> {
    match context.client().refresh_session().await {
        Ok(_) => {
            println!("Access token refreshed.");
            Ok(())
        }
        Err(err) if err.is_teardown() => {
            bail!("session is no longer valid ({err}); log in again")
        }
        Err(err) => Err(err).context("token refresh failed"),
    }
}

async fn auth_logout(context: &SessionContext<FileTokenStore>) -> Result<()> {
    context.logout().await;
    println!("Logged out.");
    Ok(())
}

async fn user_me(context: &SessionContext<FileTokenStore>, args: MeArgs) -> Result<()> {
    let user = require_session(context).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        render_user(&user);
    }
    Ok(())
}

async fn api_get(context: &SessionContext<FileTokenStore>, args: GetArgs) -> Result<()> {
    require_session(context).await?;
    let body: serde_json::Value = match context.client().get_json(&args.path).await {
        Ok(body) => body,
        Err(err) if err.is_teardown() => bail!("session expired; log in again"),
        Err(err) => return Err(err).with_context(|| format!("GET {} failed", args.path)),
    };
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn require_session(context: &SessionContext<FileTokenStore>) -> Result<UserSnapshot> {
    match context.restore_from_storage().await {
        SessionState::Authenticated(user) => Ok(user),
        _ => bail!("not logged in; run `jointrip auth url` first"),
    }
}

fn render_user(user: &UserSnapshot) {
    println!("Name : {}", user.display_name());
    println!("Email: {}", user.email);
    println!("ID   : {}", user.id);
    if let Some(picture) = &user.picture {
        println!("Photo: {}", picture);
    }
    println!("Verified: {}", if user.is_verified { "yes" } else { "no" });
}
