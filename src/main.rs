//! Thin demonstration shell over the library API: `create`, `open`,
//! `insert`, `get`, `delete`, `visualize`. Not part of the tested contract
//! beyond "it compiles and calls through correctly".

use anyhow::{bail, Result};
use env_logger::Env;
use kvpage_engine::Db;

fn usage() -> ! {
    eprintln!(
        "usage:\n  create <name>\n  open <name> insert <key> <value>\n  open <name> get <key>\n  open <name> delete <key>\n  open <name> visualize"
    );
    std::process::exit(2);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
    }

    match args[1].as_str() {
        "create" => {
            let name = args.get(2).unwrap_or_else(|| usage());
            let db = Db::create(name)?;
            db.close()?;
            println!("created database {name}");
        }
        "open" => {
            let name = args.get(2).unwrap_or_else(|| usage());
            let mut db = Db::open(name)?;
            let command = args.get(3).map(String::as_str).unwrap_or_else(|| usage());
            match command {
                "insert" => {
                    let key: u32 = args.get(4).unwrap_or_else(|| usage()).parse()?;
                    let value = args.get(5).unwrap_or_else(|| usage());
                    db.insert(key, value.as_bytes())?;
                    println!("inserted key {key}");
                }
                "get" => {
                    let key: u32 = args.get(4).unwrap_or_else(|| usage()).parse()?;
                    let (value, found) = db.search(key)?;
                    if found {
                        println!("{}", String::from_utf8_lossy(&value));
                    } else {
                        println!("key {key} not found");
                    }
                }
                "delete" => {
                    let key: u32 = args.get(4).unwrap_or_else(|| usage()).parse()?;
                    db.delete(key)?;
                    println!("deleted key {key}");
                }
                "visualize" => {
                    print!("{}", db.visualize()?);
                }
                other => bail!("unknown command: {other}"),
            }
            db.close()?;
        }
        other => bail!("unknown command: {other}"),
    }

    Ok(())
}
