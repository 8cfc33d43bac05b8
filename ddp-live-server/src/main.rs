//! Standalone live data server over an in-memory store.
//!
//! Registers generic document methods and one publication:
//! - `insert(collection, fields[, id])` → id
//! - `update(collection, id, fields)`; a `null` value clears the field
//! - `remove(collection, id)`
//! - publication `collection(name[, selector])`

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ddp_live::{
    DocumentStore, FieldChanges, Fields, MemoryStore, MethodContext, MethodError, PublishContext, Query,
    ServerConfig, SyncServer, Value,
};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "ddp-live-server", about = "Serve live data over WebSockets.")]
struct Args {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    bind: Option<String>,

    /// Path prefix for socket endpoints
    #[arg(long)]
    prefix: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.path_prefix = prefix.clone();
    }
    Ok(config)
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, MethodError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| MethodError::new(400, format!("Expected string parameter '{name}'")))
}

fn object_param(params: &[Value], index: usize, name: &str) -> Result<Fields, MethodError> {
    match params.get(index) {
        Some(value) => value
            .as_object()
            .cloned()
            .ok_or_else(|| MethodError::new(400, format!("Expected object parameter '{name}'"))),
        None => Ok(Fields::new()),
    }
}

fn insert(ctx: &MethodContext<'_>, params: &[Value]) -> Result<Value, MethodError> {
    let collection = str_param(params, 0, "collection")?;
    let fields = object_param(params, 1, "fields")?;
    let id = params.get(2).and_then(Value::as_str).map(str::to_string);
    let id = ctx.store.insert(collection, id, fields)?;
    Ok(Value::from(id))
}

fn update(ctx: &MethodContext<'_>, params: &[Value]) -> Result<Value, MethodError> {
    let collection = str_param(params, 0, "collection")?;
    let id = str_param(params, 1, "id")?;
    let changes: FieldChanges = object_param(params, 2, "fields")?
        .into_iter()
        .map(|(key, value)| (key, (!value.is_null()).then_some(value)))
        .collect();
    ctx.store.update(collection, id, &changes)?;
    Ok(Value::Null)
}

fn remove(ctx: &MethodContext<'_>, params: &[Value]) -> Result<Value, MethodError> {
    let collection = str_param(params, 0, "collection")?;
    let id = str_param(params, 1, "id")?;
    ctx.store.remove(collection, id)?;
    Ok(Value::Null)
}

fn publish_collection(_: &PublishContext<'_>, params: &[Value]) -> Result<Vec<Query>, MethodError> {
    let name = str_param(params, 0, "name")?;
    let mut query = Query::new(name);
    query.selector = object_param(params, 1, "selector")?;
    Ok(vec![query])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = load_config(&args)?;
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new(config.broadcast_capacity));
    let mut server = SyncServer::new(config, store);
    server
        .method("insert", insert)
        .method("update", update)
        .method("remove", remove)
        .publish("collection", publish_collection);

    info!("Starting live data server on {}", server.config().bind_addr);
    server.run().await?;
    Ok(())
}
