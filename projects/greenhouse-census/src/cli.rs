use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// SQLite database file
    #[arg(long, env = "GREENHOUSE_DATABASE", default_value = "data/census.db")]
    pub database: PathBuf,

    /// Root directory of the object store holding uploads and results
    #[arg(long, env = "GREENHOUSE_STORAGE_ROOT")]
    pub storage_root: PathBuf,

    /// Pipeline configuration (JSON); defaults apply when omitted
    #[arg(long, env = "GREENHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Location directory (JSON) with boundaries and expected products
    #[arg(long, env = "GREENHOUSE_LOCATIONS")]
    pub locations: Option<PathBuf>,

    /// Load inference models before accepting requests
    #[arg(long, env = "GREENHOUSE_WARM_UP")]
    pub warm_up: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
