use clap::Subcommand;

pub mod batch;
pub mod cache;
pub mod compile;
pub mod history;

use self::batch::BatchArgs;
use self::cache::CacheCommands;
use self::compile::CompileArgs;
use self::history::HistoryArgs;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Compile once and wait for the result
    #[command(visible_alias = "c")]
    Compile(CompileArgs),

    /// Run every compile request in a JSON manifest
    #[command(visible_alias = "b")]
    Batch(BatchArgs),

    /// Inspect or clear the compile cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show recently finished compiles
    History(HistoryArgs),
}
