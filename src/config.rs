use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::DEFAULT_MODEL_ID;

/// Web chat over a pretrained DialoGPT model.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// Address the web page is served on.
    #[arg(long, env = "DIALO_CHAT_BIND", default_value = "127.0.0.1:8501")]
    pub bind: SocketAddr,

    /// Directory holding one subdirectory per model.
    #[arg(long, env = "DIALO_CHAT_MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    /// Model to load from the models directory.
    #[arg(long, env = "DIALO_CHAT_MODEL", default_value = DEFAULT_MODEL_ID)]
    pub model: String,

    /// Load the model on the first message instead of at startup.
    #[arg(long)]
    pub no_warmup: bool,

    /// Minutes a browser session may sit idle before it is forgotten.
    #[arg(long, env = "DIALO_CHAT_SESSION_IDLE_MINUTES", default_value_t = 60)]
    pub session_idle_minutes: u64,
}

impl Settings {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_minutes.max(1) * 60)
    }
}
