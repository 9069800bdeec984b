#[tokio::main]
async fn main() {
    lingua_backend::serve().await;
}
