use anyhow::Result;
use identity_access::cli::start;

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;
    action.execute().await?;
    Ok(())
}
