use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{model::SessionTree, request_manager::decode_response};
use protocol_adapter::FeedProtocolAdapter;
use storage::{prepare_database_url, ContentStore, FeedStore, HEAD_SESSION_ID};

#[derive(Parser, Debug)]
#[command(about = "Inspect and maintain a feed store")]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/feed.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List head and stored sessions with their node counts.
    Sessions,
    /// List stored content ids.
    Content,
    /// List recorded dismiss actions.
    Actions,
    /// Remove content and actions nothing references anymore.
    Gc,
    /// Drop every session and all content, keeping actions.
    Reset,
    /// Decode a captured response and print its canonical operations.
    Decode {
        file: PathBuf,
        #[arg(long)]
        length_prefixed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    match cli.command {
        Command::Decode {
            file,
            length_prefixed,
        } => decode(&file, length_prefixed),
        command => {
            let database_url = prepare_database_url(&cli.database_url)?;
            let store = FeedStore::open(&database_url).await?;
            run(&store, command).await
        }
    }
}

async fn run(store: &FeedStore, command: Command) -> Result<()> {
    match command {
        Command::Sessions => {
            let mut sessions = vec![HEAD_SESSION_ID.to_string()];
            sessions.extend(store.get_all_sessions().await?);
            for session_id in sessions {
                let structures = store.get_stream_structures(&session_id).await?;
                let tree = SessionTree::replay(&structures);
                println!(
                    "{session_id} journal={} nodes={}",
                    structures.len(),
                    tree.len()
                );
            }
        }
        Command::Content => {
            let content_ids = store.get_all_content_ids().await?;
            for content_id in &content_ids {
                println!("{content_id}");
            }
            println!("total={}", content_ids.len());
        }
        Command::Actions => {
            for action in store.get_all_dismiss_actions().await? {
                println!(
                    "{} {} {}",
                    action.recorded_at.to_rfc3339(),
                    action.action_type.as_str(),
                    action.content_id
                );
            }
        }
        Command::Gc => {
            let (content_removed, actions_removed) = collect_garbage(store).await?;
            println!("removed content={content_removed} actions={actions_removed}");
        }
        Command::Reset => {
            store.reset().await?;
            println!("store reset");
        }
        Command::Decode {
            file,
            length_prefixed,
        } => decode(&file, length_prefixed)?,
    }
    Ok(())
}

fn decode(file: &Path, length_prefixed: bool) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let response = decode_response(&bytes, length_prefixed)?;
    let adapter = FeedProtocolAdapter::default();
    for operation in adapter.create_model(&response)? {
        println!("{}", serde_json::to_string(&operation)?);
    }
    let stats = adapter.stats();
    eprintln!("operations={} dropped={}", stats.operations, stats.dropped);
    Ok(())
}

/// Offline collection: with no live sessions, everything reachable from a
/// stored journal, an action or a shared state is kept.
async fn collect_garbage(store: &FeedStore) -> Result<(usize, usize)> {
    let mut reserved = HashSet::new();
    let mut sessions = store.get_all_sessions().await?;
    sessions.push(HEAD_SESSION_ID.to_string());
    for session_id in &sessions {
        let structures = store.get_stream_structures(session_id).await?;
        reserved.extend(SessionTree::replay(&structures).content_id_set());
    }
    for action in store.get_all_dismiss_actions().await? {
        reserved.insert(action.content_id);
    }
    for shared_state in store.get_shared_states().await? {
        reserved.insert(shared_state.content_id);
    }

    let content = store
        .trigger_content_gc(reserved, Box::new(HashSet::new))
        .await?;
    let actions = store.get_all_dismiss_actions().await?;
    let valid_ids = store.get_all_content_ids().await?;
    let removed_actions = store.trigger_action_gc(actions, valid_ids).await?;
    Ok((content.removed, removed_actions.removed))
}
