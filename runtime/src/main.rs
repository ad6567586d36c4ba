#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lumi_runtime::app::run().await
}
