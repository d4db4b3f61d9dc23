use ansi_term::{self, Colour};
use clap::{Parser, Subcommand};
use cli_table::{print_stdout, Cell, Style, Table};
use tollgate::pricing::Stats;

#[tokio::main]
async fn main() {
    banner("tollgate CLI");
    let cli = Cli::parse();

    match cli.command {
        Commands::Stats { server } => {
            if let Err(e) = app_stats(&server).await {
                eprintln!("failed to fetch stats from {server}: {e}");
                std::process::exit(1);
            }
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "tollgate management CLI tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// fetches live pricing-engine usage stats from a running server
    Stats {
        #[arg(long, default_value = "http://127.0.0.1:3030")]
        server: String,
    },
}

/// Prints out the `cli` tool banner
fn banner(quote: &str) {
    const BTC: &str = r"
        ──▄▄█▀▀▀▀▀█▄▄──
        ▄█▀░░▄░▄░░░░▀█▄
        █░░░▀█▀▀▀▀▄░░░█
        █░░░░█▄▄▄▄▀░░░█
        █░░░░█░░░░█░░░█
        ▀█▄░▀▀█▀█▀░░▄█▀
        ──▀▀█▄▄▄▄▄█▀▀──";
    let text = format!("{:-^34}\n{}\n", quote, Colour::Yellow.paint(BTC));
    println!("{}", text);
}

async fn app_stats(server: &str) -> Result<(), anyhow::Error> {
    let stats: Stats = reqwest::get(format!("{server}/admin/stats"))
        .await?
        .error_for_status()?
        .json()
        .await?;

    let rows = vec![
        vec!["contexts".cell(), stats.contexts.cell()],
        vec!["agents".cell(), stats.agents.cell()],
        vec!["total actions".cell(), stats.total_actions.cell()],
    ];
    let table = rows
        .table()
        .title(vec!["metric".cell().bold(true), "value".cell().bold(true)]);
    print_stdout(table)?;
    Ok(())
}
