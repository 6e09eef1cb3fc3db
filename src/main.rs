#[tokio::main]
async fn main() -> std::io::Result<()> {
    chat_console::app::run().await
}
