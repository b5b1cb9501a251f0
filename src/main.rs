#[tokio::main]
async fn main() {
    if let Err(error) = market_sync::run().await {
        tracing::error!(error = %error, "market-sync exited");
        eprintln!("market-sync: {error}");
        std::process::exit(1);
    }
}
