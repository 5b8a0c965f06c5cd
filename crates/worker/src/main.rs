use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lazyscale_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LAZYSCALE_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lazyscale_worker=debug,lazyscale_watcher=debug,lazyscale_pipeline=info,lazyscale_queue=info"
                    .into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        manifest = %config.manifest.display(),
        output_dir = %config.output_dir.display(),
        "Loaded worker configuration",
    );

    // --- Run ---
    let summary = lazyscale_worker::run(&config).await?;
    tracing::info!(
        eligible = summary.eligible,
        upscaled = summary.upscaled,
        failed = summary.failed,
        written = summary.written.len(),
        "Worker finished",
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
