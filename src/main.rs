#[tokio::main]
async fn main() -> anyhow::Result<()> {
    harvest_proxy::run().await
}
