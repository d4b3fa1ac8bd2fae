use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tracker-sync",
    version,
    about = "Headless presence and incident sync driver"
)]
pub struct Args {
    #[arg(long, default_value = "demo@example.com")]
    pub email: String,
    #[arg(long, default_value = "demo-pass")]
    pub password: String,
    #[arg(long)]
    pub name: Option<String>,
    /// Register the account as the configured super-admin.
    #[arg(long, default_value_t = false)]
    pub admin: bool,
    /// Stop after this many seconds; runs until Ctrl-C when omitted.
    #[arg(long)]
    pub run_seconds: Option<u64>,
    #[arg(long, default_value_t = 3)]
    pub simulated_users: usize,
}
