use qpush_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    match run_cli().await {
        Ok(report) => {
            for line in &report.lines {
                println!("{}", line);
            }
            if report.failures > 0 {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("CLI error: {}", e);
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
