use tandem::relay::{RelayServer, default_bind_addr};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr = std::env::args().nth(1).unwrap_or_else(default_bind_addr);

    println!("   Tandem Signaling Relay");
    println!("   Binding to {}", bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = RelayServer::bind(&bind_addr).await?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\n   Shutting down");
            Ok(())
        }
    }
}
