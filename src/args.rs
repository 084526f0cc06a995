use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hypcast-server")]
#[command(version)]
#[command(about = "ATSC tuner streaming server", long_about = None)]
pub struct Args {
    /// Address for the HTTP server to listen on
    #[arg(long, default_value = ":9200")]
    pub addr: String,

    /// Path to the channels.conf file containing the list of available channels
    #[arg(long, default_value = "/etc/hypcast/channels.conf")]
    pub channels: PathBuf,

    /// Path to client assets
    #[arg(long)]
    pub assets: Option<PathBuf>,

    /// Video pipeline implementation (default, lowpower, vaapi)
    #[arg(long, default_value = "default")]
    pub video_pipeline: String,
}

impl Args {
    /// The bind address, with a bare `:port` expanded to all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}
