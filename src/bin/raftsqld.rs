//! Interactive single-node shell: opens a bootstrap store and feeds it
//! SQL from stdin. Useful for poking at the store without any transport.

use std::io::{BufRead, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use raftsql::{
    ClusterRouter, Consistency, ExecuteRequest, QueryRequest, Statement, Store, StoreConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster-unique node id.
    #[arg(long, default_value = "node-1")]
    id: String,

    /// Advertised address (informational for a single node).
    #[arg(long, default_value = "localhost:4001")]
    addr: String,

    /// Data directory for the raft log, snapshots and the database.
    #[arg(long, default_value = "raftsql-data")]
    dir: PathBuf,

    /// Keep the SQL state in memory instead of on disk.
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = StoreConfig::new(&args.id, &args.addr, &args.dir).in_memory(args.memory);
    let store = Store::open(config, ClusterRouter::new(), true)
        .await
        .context("failed to open store")?;
    store
        .wait_for_leader(std::time::Duration::from_secs(10))
        .await
        .context("no leader elected")?;

    println!("raftsql shell — node {} ready, .quit to exit", args.id);
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        if sql == ".quit" || sql == ".exit" {
            break;
        }

        let lowered = sql.to_ascii_lowercase();
        if lowered.starts_with("select") || lowered.starts_with("pragma") {
            let req = QueryRequest::new(vec![Statement::new(sql)], Consistency::Weak);
            match store.query(&req).await {
                Ok(results) => {
                    for result in results {
                        if let Some(err) = result.error {
                            println!("error: {err}");
                            continue;
                        }
                        println!("{}", result.columns.join("|"));
                        for row in result.values {
                            let cells: Vec<String> =
                                row.iter().map(|v| format!("{v:?}")).collect();
                            println!("{}", cells.join("|"));
                        }
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        } else {
            let req = ExecuteRequest::new(vec![Statement::new(sql)]);
            match store.execute(&req).await {
                Ok(results) => {
                    for result in results {
                        match result.error {
                            Some(err) => println!("error: {err}"),
                            None => println!("ok, {} row(s) affected", result.rows_affected),
                        }
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        }
    }

    store.close(true).await?;
    Ok(())
}
