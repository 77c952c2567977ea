use std::sync::Arc;

use clap::Parser;

use cirrusdb::{Db, Error, LocalObjectStore};

/// Demo walk-through: open a database against a filesystem-backed bucket,
/// then put, get, and delete a key.
#[derive(Parser, Debug)]
#[command(name = "cirrusdb", version, about)]
struct Args {
    /// Directory backing the object store.
    #[arg(long, default_value = "/tmp/cirrusdb-bucket")]
    bucket: String,

    /// Database name (namespace prefix inside the bucket).
    #[arg(long, default_value = "testdb")]
    db: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let store = Arc::new(LocalObjectStore::new(&args.bucket)?);
    let db = Db::open(args.db, store)?;

    let key = b"key1";
    let value = b"value1";

    db.put(key, value)?;
    println!("Put: {} {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));

    let data = db.get(key)?;
    println!("Get: {} {}", String::from_utf8_lossy(key), String::from_utf8_lossy(&data));

    db.delete(key)?;
    match db.get(key) {
        Err(Error::KeyNotFound) => println!("Delete: {}", String::from_utf8_lossy(key)),
        Err(err) => return Err(err.into()),
        Ok(_) => anyhow::bail!("key survived deletion"),
    }

    db.close()?;
    Ok(())
}
