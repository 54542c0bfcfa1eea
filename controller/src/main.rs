mod board;
mod host;
mod nvfile;
mod radio;
mod room;
mod seal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
