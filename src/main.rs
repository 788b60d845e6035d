use std::sync::Arc;

use switchmq::store::MemoryBackend;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    switchmq::run()
        .backend(Arc::new(MemoryBackend::new()))
        .start()
        .await
}
