use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chunkgw::client::Client;
use chunkgw::protocol::{
    CatRequest, CopyFlags, CopyRequest, DeleteRequest, ListRequest, ObsoleteRequest, PutRequest,
    UntrashifyRequest,
};

#[derive(Parser, Debug)]
#[command(name = "chunkgw-client", version, about = "Talk to a chunkgw gateway")]
struct Cli {
    /// Gateway socket
    #[arg(short, long, env = "CHUNKGW_SOCKET", default_value = "/tmp/chunkgw.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an object to stdout
    Cat {
        name: String,
        #[arg(long)]
        decrypt: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Store stdin as an object
    Put {
        name: String,
        #[arg(long)]
        encrypt: bool,
    },
    /// List objects under a prefix
    List { prefix: String },
    /// Copy referenced objects from another installation
    Copy {
        name: String,
        /// Config file of the source installation
        #[arg(long)]
        source_config: String,
        #[arg(long)]
        port: u64,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        decrypt: bool,
        /// Require a backend-native copy
        #[arg(long)]
        server_side: bool,
        #[arg(long)]
        confirm: bool,
    },
    /// Delete one object, or collect garbage under a prefix
    Delete {
        name: String,
        #[arg(long)]
        port: u64,
        #[arg(long)]
        segnum: u64,
        #[arg(long)]
        garbage: bool,
        #[arg(long)]
        crazy_drop: bool,
        #[arg(long)]
        confirm: bool,
    },
    /// Restore trashed objects
    Untrashify {
        name: String,
        #[arg(long)]
        segnum: u64,
        #[arg(long)]
        confirm: bool,
    },
    /// Record unreferenced objects in the expire index
    CollectObsolete {
        prefix: String,
        #[arg(long)]
        segnum: u64,
        #[arg(long)]
        port: u64,
        #[arg(long, default_value = "")]
        database: String,
    },
    /// Trash expired objects already covered by a backup
    DeleteObsolete {
        prefix: String,
        #[arg(long)]
        segnum: u64,
        #[arg(long)]
        port: u64,
        #[arg(long, default_value = "")]
        database: String,
    },
    /// Liveness probe (use with the interconnect socket)
    Gool,
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new(&cli.socket);

    match cli.command {
        Command::Cat {
            name,
            decrypt,
            offset,
        } => {
            let req = CatRequest {
                name,
                decrypt,
                offset,
                ..Default::default()
            };
            client.cat(req, &mut tokio::io::stdout()).await?;
        }
        Command::Put { name, encrypt } => {
            let req = PutRequest {
                name,
                encrypt,
                settings: Vec::new(),
            };
            let key_version = client.put(req, &mut tokio::io::stdin()).await?;
            eprintln!("stored (key version {key_version})");
        }
        Command::List { prefix } => {
            let objects = client
                .list(ListRequest {
                    prefix,
                    settings: Vec::new(),
                })
                .await?;
            for obj in objects {
                println!("{}\t{}", obj.size, obj.path);
            }
        }
        Command::Copy {
            name,
            source_config,
            port,
            encrypt,
            decrypt,
            server_side,
            confirm,
        } => {
            let mut flags = CopyFlags::empty();
            flags.set(CopyFlags::ENCRYPT, encrypt);
            flags.set(CopyFlags::DECRYPT, decrypt);
            flags.set(CopyFlags::SERVER_SIDE, server_side);
            client
                .copy(CopyRequest {
                    name,
                    source_config,
                    port,
                    confirm,
                    flags,
                })
                .await?;
        }
        Command::Delete {
            name,
            port,
            segnum,
            garbage,
            crazy_drop,
            confirm,
        } => {
            client
                .delete(DeleteRequest {
                    name,
                    port,
                    segnum,
                    confirm,
                    garbage,
                    crazy_drop,
                })
                .await?;
        }
        Command::Untrashify {
            name,
            segnum,
            confirm,
        } => {
            client
                .untrashify(UntrashifyRequest {
                    name,
                    segnum,
                    confirm,
                })
                .await?;
        }
        Command::CollectObsolete {
            prefix,
            segnum,
            port,
            database,
        } => {
            client
                .collect_obsolete(ObsoleteRequest {
                    segnum,
                    port,
                    database,
                    prefix,
                })
                .await?;
        }
        Command::DeleteObsolete {
            prefix,
            segnum,
            port,
            database,
        } => {
            client
                .delete_obsolete(ObsoleteRequest {
                    segnum,
                    port,
                    database,
                    prefix,
                })
                .await?;
        }
        Command::Gool => client.gool().await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run(Cli::parse()).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
