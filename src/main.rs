#[tokio::main]
async fn main() {
    if let Err(e) = hostsync_lib::run().await {
        log::error!("hostsync exited: {}", e);
        eprintln!("hostsync: {}", e);
        std::process::exit(1);
    }
}
