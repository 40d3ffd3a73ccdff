use anyhow::{bail, Context, Result};
use clap::Parser;
use misp_provision::{
    cli::{Cli, Commands},
    config,
    misp::MispClient,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Credentials commonly live in a .env file next to the tool
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let base_url = cli
        .base_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .context("MISP base URL is required (--base-url or MISP_BASE_URL)")?;

    let policy = config::CertPolicy::from_env()?;
    let client = MispClient::new(base_url, &policy)
        .context("Failed to create MISP session")?;

    match cli.command {
        Commands::LoadDefaultFeeds => load_default_feeds(&client),
        Commands::FeedsCount => feeds_count(&client),
        Commands::ConfigureFeeds => configure_feeds(&client),
        Commands::CacheFeeds => cache_feeds(&client),
        Commands::FetchAllFeeds => fetch_all_feeds(&client),
        Commands::ProvisionFeeds => provision_feeds(&client),
    }
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    Ok(())
}

fn load_default_feeds(client: &MispClient) -> Result<()> {
    let auth = config::auth_from_env()?;
    info!("Logging in to the MISP web UI");
    client.login(&auth)?;
    client.load_default_feeds()?;
    println!("OK");
    Ok(())
}

fn feeds_count(client: &MispClient) -> Result<()> {
    let api_key = config::api_key_from_env()?;
    let feeds = client.list_feeds(&api_key)?;
    println!("{}", feeds.len());
    Ok(())
}

fn configure_feeds(client: &MispClient) -> Result<()> {
    let api_key = config::api_key_from_env()?;
    let summary = client.enable_all_feeds(&api_key)?;
    println!("{summary}");
    if summary.failed > 0 {
        bail!("{} feed(s) could not be enabled", summary.failed);
    }
    Ok(())
}

fn cache_feeds(client: &MispClient) -> Result<()> {
    let api_key = config::api_key_from_env()?;
    client.cache_all_feeds(&api_key)?;
    println!("OK");
    Ok(())
}

fn fetch_all_feeds(client: &MispClient) -> Result<()> {
    let api_key = config::api_key_from_env()?;
    client.fetch_all_feeds(&api_key)?;
    println!("OK");
    Ok(())
}

fn provision_feeds(client: &MispClient) -> Result<()> {
    let auth = config::auth_from_env()?;
    let api_key = config::api_key_from_env()?;

    info!("Running full feed provisioning sequence");
    let report = client.provision_all(&auth, &api_key);

    for step in &report.steps {
        let marker = if step.ok { "✓" } else { "✗" };
        println!("{} {}: {}", marker, step.step, step.detail);
    }

    if !report.success() {
        bail!("Provisioning incomplete: {} step(s) failed", report.failed_steps());
    }
    println!("All feeds provisioned");
    Ok(())
}
