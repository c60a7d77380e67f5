use anyhow::Result;
use query_exporter::cli::{actions, start};

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    actions::run::handle(action).await
}
