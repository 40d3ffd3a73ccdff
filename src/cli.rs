use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "misp-provision",
    about = "Provision threat-intelligence feeds on a MISP instance",
    version,
    author
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// MISP base URL, e.g. https://misp.example.org
    #[arg(long, global = true, env = "MISP_BASE_URL")]
    pub base_url: Option<String>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in through the web UI and load the default feed definitions
    LoadDefaultFeeds,

    /// Print the number of feeds known to the instance
    FeedsCount,

    /// Enable (and mark for caching) every feed that is not yet operational
    ConfigureFeeds,

    /// Trigger caching of all feeds
    CacheFeeds,

    /// Trigger fetching from all feeds
    FetchAllFeeds,

    /// Run the full provisioning sequence: login, load defaults, enable,
    /// fetch, cache
    ProvisionFeeds,
}
