//! evstore — command line client for an evstore node.
//!
//! # Usage
//!
//! ```text
//! evstore --endpoint 127.0.0.1:1113 append orders-1 OrderPlaced '{"id":1}'
//! evstore read orders-1 --count 10
//! evstore subscribe orders-1 --from 0
//! evstore projections list --kind continuous
//! ```

use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod settings;

use settings::GlobalArgs;

#[derive(Parser)]
#[command(
    name = "evstore",
    about = "Command line client for the evstore event database",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one event to a stream
    Append {
        stream: String,
        event_type: String,
        /// Event body. Sent as JSON unless --binary is given.
        #[arg(default_value = "{}")]
        data: String,
        /// any, no-stream, exists, or an event number
        #[arg(short, long, default_value = "any")]
        expected: String,
        #[arg(long)]
        binary: bool,
    },
    /// Read a slice of a stream
    Read {
        stream: String,
        /// First event number; -1 reads backward from the end
        #[arg(short, long, default_value = "0")]
        from: i64,
        #[arg(short, long, default_value = "20")]
        count: i32,
        #[arg(short, long)]
        backward: bool,
        #[arg(long)]
        resolve_links: bool,
    },
    /// Read a slice of the global log
    ReadAll {
        #[arg(short, long, default_value = "20")]
        count: i32,
        #[arg(short, long)]
        backward: bool,
    },
    /// Follow a stream (or $all) from a checkpoint until Ctrl-C
    Subscribe {
        /// Stream to follow; omit for every stream
        stream: Option<String>,
        /// Last processed event number; omit to start from the beginning
        #[arg(short, long)]
        from: Option<i64>,
        #[arg(long)]
        resolve_links: bool,
    },
    /// Join a persistent subscription group and acknowledge as events arrive
    Persistent {
        stream: String,
        group: String,
        #[arg(short, long, default_value = "10")]
        buffer_size: usize,
        /// Create the group first, starting from the beginning of the stream
        #[arg(long)]
        create: bool,
    },
    /// Projection administration over HTTP
    Projections {
        #[command(subcommand)]
        action: ProjectionsAction,
    },
}

#[derive(Subcommand)]
enum ProjectionsAction {
    /// List projections
    List {
        #[arg(short, long, value_enum, default_value_t = ProjectionKind::All)]
        kind: ProjectionKind,
        /// HTTP endpoint; defaults to the TCP host on port 2113
        #[arg(long)]
        http_endpoint: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProjectionKind {
    All,
    Continuous,
    OneTime,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,evstore=debug".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.global.connection_settings()?;

    match cli.command {
        Commands::Append {
            stream,
            event_type,
            data,
            expected,
            binary,
        } => commands::streams::append(settings, &stream, &event_type, data, &expected, !binary).await,
        Commands::Read {
            stream,
            from,
            count,
            backward,
            resolve_links,
        } => commands::streams::read(settings, &stream, from, count, backward, resolve_links).await,
        Commands::ReadAll { count, backward } => commands::streams::read_all(settings, count, backward).await,
        Commands::Subscribe {
            stream,
            from,
            resolve_links,
        } => commands::subscribe::catch_up(settings, stream, from, resolve_links).await,
        Commands::Persistent {
            stream,
            group,
            buffer_size,
            create,
        } => commands::subscribe::persistent(settings, &stream, &group, buffer_size, create).await,
        Commands::Projections { action } => match action {
            ProjectionsAction::List { kind, http_endpoint } => {
                let endpoint = cli.global.http_endpoint(&settings, http_endpoint.as_deref())?;
                commands::projections::list(&settings, endpoint, kind).await
            }
        },
    }
}
