use std::io::Write;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};

pub mod proto {
    tonic::include_proto!("proto");
}

use proto::rpc_client::RpcClient;
use proto::{CreateDatabaseRequest, Encoding, ExecuteRequest, Query, Void};

#[derive(StructOpt, Debug)]
#[structopt(name = "shard")]
struct Opt {
    /// Client RPC address of the node to talk to.
    #[structopt(short, long, default_value = "http://127.0.0.1:60001")]
    addr: String,
    /// Database to start with.
    #[structopt(short, long, default_value = "main")]
    database: String,
}

fn prompt(database: &str) -> std::io::Result<()> {
    print!("{}=# ", database);
    std::io::stdout().flush()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();
    let mut client = RpcClient::connect(opt.addr.clone()).await?;
    let mut database = opt.database;
    let stdin = tokio::io::stdin();
    let rdr = BufReader::new(stdin);
    let mut lines = rdr.lines();
    prompt(&database)?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("\\c ") {
            database = name.trim().to_string();
        } else if let Some(name) = line.strip_prefix("\\create ") {
            let request = tonic::Request::new(CreateDatabaseRequest {
                database: name.trim().to_string(),
            });
            match client.create_database(request).await {
                Ok(response) => println!("created at {}", response.into_inner().path),
                Err(status) => println!("error: {}", status.message()),
            }
        } else if line == "\\s" {
            let status = client.status(tonic::Request::new(Void {})).await?.into_inner();
            for group in status.groups {
                println!(
                    "{}: role={} leader={} applied={}",
                    group.group, group.role, group.leader_addr, group.applied_index
                );
            }
            println!("all leaders healthy: {}", status.all_leaders_healthy);
        } else if line.to_lowercase().starts_with("select") {
            let query = tonic::Request::new(Query {
                database: database.clone(),
                sql: line.to_string(),
            });
            match client.query(query).await {
                Ok(response) => {
                    for row in response.into_inner().rows {
                        println!("{:?}", row.values);
                    }
                }
                Err(status) => println!("error: {}", status.message()),
            }
        } else if !line.is_empty() {
            let request = tonic::Request::new(ExecuteRequest {
                database: database.clone(),
                sql: line.to_string(),
                encoding: Encoding::Structured as i32,
                timeout_ms: 0,
            });
            match client.execute(request).await {
                Ok(response) => {
                    let result = response.into_inner();
                    println!("applied at index {}", result.index);
                    for error in result.errors {
                        println!("error: {}", error);
                    }
                }
                Err(status) => println!("error: {}", status.message()),
            }
        }
        prompt(&database)?;
    }
    Ok(())
}
