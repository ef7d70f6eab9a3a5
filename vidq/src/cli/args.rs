//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::scheduler::EnqueuePolicy;

/// vidq - Queue and run FFmpeg transcoding jobs
#[derive(Parser, Debug)]
#[command(name = "vidq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server port (defaults to the running server, then VIDQ_PORT)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the transcoding service
    Serve(ServeArgs),

    /// Submit a transcoding job
    Submit {
        /// Source video file
        input: PathBuf,

        /// Output directory
        output: PathBuf,

        /// Target container format
        #[arg(short, long, default_value = "mp4")]
        format: String,

        /// Target resolution (480p, 720p, 1080p, 2160p)
        #[arg(short, long, default_value = "720p")]
        resolution: String,

        /// Higher runs first
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
    },

    /// Show a job
    Status {
        /// Job ID
        id: String,
    },

    /// List running jobs
    Jobs {
        /// List waiting jobs instead
        #[arg(long)]
        queued: bool,
    },

    /// Cancel a job
    Cancel {
        /// Job ID
        id: String,
    },

    /// Pause a running job
    Pause {
        /// Job ID
        id: String,
    },

    /// Resume a paused job
    Resume {
        /// Job ID
        id: String,
    },

    /// Requeue a failed job
    Retry {
        /// Job ID
        id: String,
    },

    /// Requeue every failed job
    RetryFailed,

    /// Change a job's priority
    Priority {
        /// Job ID
        id: String,

        /// New priority
        #[arg(allow_hyphen_values = true)]
        priority: i32,
    },

    /// Show a job's log
    Logs {
        /// Job ID
        id: String,
    },

    /// List supported output formats
    Formats,

    /// Show service health
    Health,

    /// Delete completed jobs from the database (offline)
    Purge {
        /// Keep jobs completed within this many days
        #[arg(long, default_value = "7")]
        days: u32,

        /// Database file
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Mark every failed job as queued again (offline; picked up by the next serve)
    RequeueFailed {
        /// Database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Options for `serve`. Unset options fall back to `VIDQ_*` variables.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Number of concurrent transcodes
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum number of waiting jobs
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// What to do when the queue is full
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// FFmpeg executable
    #[arg(long)]
    pub ffmpeg: Option<String>,

    /// Kill a transcode after this many seconds
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Database file
    #[arg(long, conflicts_with = "ephemeral")]
    pub db: Option<PathBuf>,

    /// Keep jobs in memory only
    #[arg(long)]
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    /// Wait for room
    Block,
    /// Fail immediately
    Reject,
}

impl From<PolicyArg> for EnqueuePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Block => Self::Block,
            PolicyArg::Reject => Self::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "vidq", "submit", "in.mov", "out", "-f", "mkv", "-r", "1080p", "--priority", "-2",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                format,
                resolution,
                priority,
                ..
            } => {
                assert_eq!(format, "mkv");
                assert_eq!(resolution, "1080p");
                assert_eq!(priority, -2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_serve_with_global_port() {
        let cli = Cli::try_parse_from([
            "vidq", "serve", "--port", "9000", "-w", "4", "--policy", "block", "--ephemeral",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(9000));
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.workers, Some(4));
        assert!(args.ephemeral);
        assert!(matches!(args.policy, Some(PolicyArg::Block)));
    }

    #[test]
    fn test_db_conflicts_with_ephemeral() {
        assert!(Cli::try_parse_from(["vidq", "serve", "--db", "x.db", "--ephemeral"]).is_err());
    }
}
