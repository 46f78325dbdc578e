use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Whether to use color in the output
    #[arg(long, global = true, default_value_t = true, action = clap::ArgAction::Set)]
    pub color: bool,

    /// How many resources may be worked on at the same time
    #[arg(long, global = true, default_value_t = 10)]
    pub parallelism: usize,

    /// The state file
    #[arg(long, global = true, default_value = "terrane.state")]
    pub state: PathBuf,
}
