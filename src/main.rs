use acme_poke::{run, AcmeCfg, AcmeLogger};
use log::error;

#[tokio::main]
async fn main() {
    // cargo run -- cmd=directory ca=le-staging
    // cargo run -- cmd=account url=https://acme-staging-v02.api.letsencrypt.org/directory contact=a@a.org tos=1
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let Err(e) = log::set_boxed_logger(Box::new(AcmeLogger)) {
        eprintln!("{}", e);
    }

    let cfg = match AcmeCfg::new(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(&cfg).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
