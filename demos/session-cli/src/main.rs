//! Hasura Auth session CLI
//!
//! A small command-line front end for the session engine. The session is
//! kept in a file between runs, so `sign-in` followed by `token` in a second
//! invocation resumes (and if needed refreshes) the same session.
//!
//! Run with: cargo run -p hasura-auth-session-cli -- --help
//!
//! Logging is controlled by `RUST_LOG`, e.g. `RUST_LOG=hasura_auth_session=debug`.

use clap::{Parser, Subcommand};
use hasura_auth_session::{
    AuthClient, AuthOptions, AuthSnapshot, FilePersistence, OnTimeout, PasswordlessOptions,
    SignUpOptions, TokenWait,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hasura-auth", version, about = "Hasura Auth session from the command line")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the Hasura Auth service
    #[arg(
        long,
        env = "HASURA_AUTH_URL",
        default_value = "http://localhost:4000/v1",
        global = true
    )]
    backend_url: String,

    /// Session file (defaults to the platform config directory)
    #[arg(long, env = "HASURA_AUTH_SESSION_FILE", global = true)]
    session_file: Option<PathBuf>,

    /// Application URL used to resolve relative redirects
    #[arg(long, global = true)]
    client_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in with email and password
    SignIn {
        email: String,
        #[arg(long, env = "HASURA_AUTH_PASSWORD")]
        password: String,
    },
    /// Create an account with email and password
    SignUp {
        email: String,
        #[arg(long, env = "HASURA_AUTH_PASSWORD")]
        password: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Sign in as a new anonymous user
    Anonymous,
    /// Answer a second-factor challenge with a TOTP code
    MfaTotp {
        #[arg(long)]
        otp: String,
        /// Ticket printed by `sign-in`; defaults to the pending one
        #[arg(long)]
        ticket: Option<String>,
    },
    /// Exchange a refresh token for a session
    ImportToken { refresh_token: String },
    /// Send a magic link
    MagicLink {
        email: String,
        #[arg(long)]
        redirect_to: Option<String>,
    },
    /// Show the current state and user
    Status,
    /// Print a valid access token
    Token {
        /// Fail instead of waiting longer than this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the Hasura claims of the access token
    Claims,
    /// Sign out and forget the session
    SignOut {
        /// Revoke every session of the user
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let options = match args.client_url {
        Some(client_url) => AuthOptions::builder()
            .backend_url(args.backend_url)
            .client_url(client_url)
            .build(),
        None => AuthOptions::builder().backend_url(args.backend_url).build(),
    };
    let persistence = args
        .session_file
        .map_or_else(FilePersistence::new, FilePersistence::with_path);
    tracing::debug!(path = %persistence.path().display(), "Using session file");

    let client = AuthClient::builder(options)
        .persistence(persistence)
        .build()?;
    client.wait_until_ready().await?;

    let outcome = run(&client, args.command).await;
    // lets a sign-out finish revoking the refresh token before exit
    client.shutdown().await;
    outcome
}

async fn run(client: &AuthClient, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::SignIn { email, password } => {
            let snapshot = client.sign_in_email_password(email, password).await?;
            report(&snapshot)?;
        }
        Commands::Anonymous => {
            let snapshot = client.sign_in_anonymous().await?;
            report(&snapshot)?;
        }
        Commands::MfaTotp { otp, ticket } => {
            let snapshot = client.sign_in_mfa_totp(otp, ticket).await?;
            report(&snapshot)?;
        }
        Commands::ImportToken { refresh_token } => {
            let snapshot = client.import_refresh_token(refresh_token).await?;
            report(&snapshot)?;
            if let Some(error) = &snapshot.context.token_error {
                anyhow::bail!("{}", error.payload);
            }
        }
        Commands::SignUp {
            email,
            password,
            display_name,
        } => {
            let options = SignUpOptions {
                display_name,
                ..Default::default()
            };
            let snapshot = client
                .sign_up_email_password(email, password, options)
                .await?;
            report(&snapshot)?;
        }
        Commands::MagicLink { email, redirect_to } => {
            let options = PasswordlessOptions {
                redirect_to,
                ..Default::default()
            };
            let snapshot = client.sign_in_passwordless_email(email, options).await?;
            report(&snapshot)?;
        }
        Commands::Status => {
            let snapshot = client.snapshot();
            println!("state: {}", snapshot.state);
            if let Some(session) = snapshot.session() {
                println!("{}", serde_json::to_string_pretty(&session.user)?);
            }
        }
        Commands::Token { timeout_secs } => {
            let gate = client.token_gate();
            let token = match timeout_secs {
                Some(secs) => {
                    let wait = TokenWait::new()
                        .timeout(Duration::from_secs(secs))
                        .on_timeout(OnTimeout::Error);
                    gate.get_valid_access_token_with(wait).await?
                }
                None => gate.get_valid_access_token().await,
            };
            match token {
                Some(token) => println!("{token}"),
                None => anyhow::bail!("not signed in"),
            }
        }
        Commands::Claims => {
            let Some(decoded) = client.decoded_access_token() else {
                anyhow::bail!("not signed in");
            };
            let claims = decoded.hasura_claims.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Commands::SignOut { all } => {
            let snapshot = client.sign_out(all).await?;
            println!("state: {}", snapshot.state);
        }
    }
    Ok(())
}

/// Print the outcome of an interactive flow
fn report(snapshot: &AuthSnapshot) -> anyhow::Result<()> {
    println!("state: {}", snapshot.state);
    if let Some(error) = &snapshot.context.error {
        anyhow::bail!("{}", error.payload);
    }
    if let Some(mfa) = &snapshot.context.mfa {
        println!(
            "second factor required, answer with: mfa-totp --otp <code> --ticket {}",
            mfa.ticket
        );
    }
    if let Some(session) = snapshot.session() {
        println!("signed in as {}", session.user.id);
    }
    Ok(())
}
