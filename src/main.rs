use jemallocator::Jemalloc;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use guildcast::{
    actor,
    command::Dispatcher,
    controller::ControllerHandle,
    entity::{GuildId, VoiceTarget},
    http,
    notify::NotifySink,
    resolver::{PreviewResolver, SearchResolver},
    settings::Settings,
    sim::{self, CatalogSearch, SimTransport},
};
use tokio::{io::AsyncBufReadExt, task::JoinSet};
use tokio_stream::{StreamExt, wrappers::LinesStream};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Per-guild audio playback scheduler")]
struct Args {
    /// TOML settings file. GUILDCAST__* environment variables override it.
    #[arg(long, env = "GUILDCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Print the effective settings and exit.
    #[arg(long)]
    print_config: bool,

    /// Playback speed of the simulated transport.
    #[arg(long, default_value_t = 1.0)]
    sim_speed: f64,
}

/// Prints notifications to stdout, next to command replies.
struct StdoutNotifier;

impl NotifySink for StdoutNotifier {
    fn notify(&self, guild: &GuildId, message: &str) {
        println!("[{guild}] {message}");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings = Settings::load(args.config.as_deref())?;
    if args.print_config {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("guildcast=info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .init();
    }

    let transport = SimTransport::with_speed(args.sim_speed);
    let search = CatalogSearch::new(sim::demo_catalog()).synthesize_misses(true);
    let resolver = PreviewResolver::with_marker(
        sim::demo_previews(),
        SearchResolver::new(search),
        settings.link_preview_marker.clone(),
    );
    let (controller, controller_actor) = ControllerHandle::new(
        Arc::new(transport),
        Arc::new(resolver),
        settings.guild_config(),
        Arc::new("root".to_string()),
    );

    let controller_task = tokio::spawn(actor::run(controller_actor));
    let mut join_set = JoinSet::new();

    if let Some(addr) = settings.http_addr {
        let cors = CorsLayer::very_permissive()
            // https://github.com/tower-rs/tower-http/issues/194
            .allow_origin(AllowOrigin::mirror_request())
            .max_age(Duration::from_secs(86400));
        let router = http::router(controller.clone()).layer(cors);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "status endpoint listening");
        join_set.spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!("status endpoint failed: {err}");
            }
        });
    }

    let dispatcher = Dispatcher::new(controller, settings.command_prefix.as_str());
    tokio::select! {
        res = read_commands(dispatcher) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    // Once every handle is gone the controller stops and tears down all
    // guild sessions.
    join_set.abort_all();
    while join_set.join_next().await.is_some() {}
    let status = controller_task.await.context("controller task failed")?;
    tracing::info!(%status, "shut down");
    Ok(())
}

/// Reads `<guild> <voice-target|-> <message>` lines from stdin.
async fn read_commands(dispatcher: Dispatcher) -> anyhow::Result<()> {
    let notify: Arc<dyn NotifySink> = Arc::new(StdoutNotifier);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = LinesStream::new(stdin.lines());

    while let Some(line) = lines.next().await {
        let line = line.context("failed to read stdin")?;
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let (Some(guild), Some(target), Some(text)) = (parts.next(), parts.next(), parts.next())
        else {
            if !line.trim().is_empty() {
                eprintln!("usage: <guild> <voice-target|-> <message>");
            }
            continue;
        };

        let guild = match guild.parse::<GuildId>() {
            Ok(guild) => guild,
            Err(err) => {
                eprintln!("invalid guild {guild:?}: {err}");
                continue;
            }
        };
        let target = match target {
            "-" => None,
            target => match target.parse::<VoiceTarget>() {
                Ok(target) => Some(target),
                Err(err) => {
                    eprintln!("invalid voice target {target:?}: {err}");
                    continue;
                }
            },
        };

        if let Some(reply) = dispatcher
            .handle_message(&guild, target, notify.clone(), text)
            .await
        {
            println!("[{guild}] {reply}");
        }
    }
    Ok(())
}
