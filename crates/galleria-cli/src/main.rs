//! Galleria CLI - a terminal frontend for a photo-gallery backend.
//!
//! The CLI does no auth or retry work of its own: it calls into
//! `galleria-core` and prints whatever data or classified error comes back.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use galleria_core::api::{ClassifiedError, Remedy};
use galleria_core::{ApiClient, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Password source for non-interactive logins
const ENV_PASSWORD: &str = "GALLERIA_PASSWORD";

const USAGE: &str = "\
Usage: galleria <command>

Commands:
  login [username]   Sign in (password from prompt or GALLERIA_PASSWORD)
  logout             Forget stored tokens
  status             Show whether a session is stored
  me                 Show the signed-in user
  images             List images
  groups             List groups
  group <id>         Show a group and its images
  browse             Fetch images and groups together";

/// Initialize the tracing subscriber for logging.
/// Returns the guard that flushes the log file on drop.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.data_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "galleria.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Exit status for a classified failure
const EXIT_FAILURE: u8 = 1;
/// Exit status for bad usage
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let store = config.credential_store()?;
    let client = ApiClient::new(&config, store)?;

    // Returning (rather than exiting) lets the log guard flush on drop.
    let code = run(&client, &mut config, &args).await;
    Ok(ExitCode::from(code))
}

/// Dispatch one command and return the process exit status.
async fn run(client: &ApiClient, config: &mut Config, args: &[String]) -> u8 {
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return EXIT_USAGE;
    };
    info!(command, api = %config.api_base_url, "galleria starting");

    let result = match command {
        "login" => login(client, config, args.get(1).cloned()).await,
        "logout" => client.logout().map(|()| println!("Signed out.")),
        "status" => {
            print_status(client);
            Ok(())
        }
        "me" => client.current_user().await.map(|user| {
            println!("{} (id {})", user.display_name(), user.id);
        }),
        "images" => client.list_images().await.map(|images| print_images(&images)),
        "groups" => client.list_groups().await.map(|groups| print_groups(&groups)),
        "group" => match args.get(1).map(|raw| raw.parse::<i64>()) {
            Some(Ok(id)) => show_group(client, id).await,
            _ => {
                eprintln!("group requires a numeric id\n\n{}", USAGE);
                return EXIT_USAGE;
            }
        },
        "browse" => browse(client).await,
        _ => {
            eprintln!("{}", USAGE);
            return EXIT_USAGE;
        }
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            report(&err);
            EXIT_FAILURE
        }
    }
}

async fn login(
    client: &ApiClient,
    config: &mut Config,
    username: Option<String>,
) -> Result<(), ClassifiedError> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ").unwrap_or_default(),
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ").unwrap_or_default(),
    };

    let user = client.login(&username, &password).await?;
    println!("Signed in as {}.", user.display_name());

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_status(client: &ApiClient) {
    let snapshot = client.session().current();
    let state = if snapshot.is_authenticated() {
        "signed in"
    } else {
        "signed out"
    };
    println!(
        "Session: {} (checked {})",
        state,
        snapshot.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

fn print_images(images: &[galleria_core::models::Image]) {
    if images.is_empty() {
        println!("No images.");
    }
    for image in images {
        println!("{:>6}  {:<40}  {}", image.id, image.display_title(), image.preview_url());
    }
}

fn print_groups(groups: &[galleria_core::models::Group]) {
    if groups.is_empty() {
        println!("No groups.");
    }
    for group in groups {
        println!("{:>6}  {:<40}  {}", group.id, group.name, group.display_image_count());
    }
}

async fn show_group(client: &ApiClient, id: i64) -> Result<(), ClassifiedError> {
    let (group, images) = futures::try_join!(client.group(id), client.group_images(id))?;
    println!("{}", group.name);
    if let Some(ref description) = group.description {
        println!("{}", description);
    }
    println!();
    print_images(&images);
    Ok(())
}

async fn browse(client: &ApiClient) -> Result<(), ClassifiedError> {
    let (images, groups) = futures::try_join!(client.list_images(), client.list_groups())?;
    println!("Groups");
    print_groups(&groups);
    println!();
    println!("Images");
    print_images(&images);
    Ok(())
}

fn report(err: &ClassifiedError) {
    eprintln!("{}", err.message);
    let hint = match err.remedy() {
        Remedy::Retry => "Run the command again to retry.",
        Remedy::ReenterCredentials => "Run `galleria login` to sign in again.",
        Remedy::FixInput => "Check what you entered and try again.",
    };
    eprintln!("{}", hint);
}
