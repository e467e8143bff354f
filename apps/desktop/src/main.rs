use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use remote::RemoteCollection;
use screen::{ScreenPhase, TodoListScreen};
use shared::domain::TodoId;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long, default_value = "todos")]
    collection: String,
    /// Add one todo before printing the list.
    #[arg(long)]
    add: Option<String>,
    /// Toggle the todo with this id before printing the list.
    #[arg(long)]
    toggle: Option<String>,
    /// Delete the todo with this id before printing the list.
    #[arg(long)]
    delete: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store = Arc::new(RemoteCollection::new(args.server_url));
    let screen = TodoListScreen::mount(store, &args.collection).await?;
    let mut events = screen.subscribe_events();

    // Wait for the first snapshot before acting on the list.
    loop {
        let state = screen.state().await;
        match state.phase {
            ScreenPhase::Ready => break,
            ScreenPhase::Failed(reason) => bail!("subscription failed: {reason}"),
            ScreenPhase::Loading => {
                let _ = events.recv().await;
            }
        }
    }

    let mutated = args.add.is_some() || args.toggle.is_some() || args.delete.is_some();

    if let Some(text) = args.add {
        screen.set_input(text).await;
        screen.submit().await?;
    }

    if let Some(id) = args.toggle {
        let id = TodoId(id);
        let state = screen.state().await;
        let item = state
            .items
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| anyhow!("no todo with id {id}"))?;
        screen.toggle(&id, item.completed).await?;
    }

    if let Some(id) = args.delete {
        screen.request_delete(TodoId(id)).await;
        screen.confirm_delete().await?;
    }

    if mutated {
        // Give the refreshed snapshot a moment to land before printing.
        let _ = tokio::time::timeout(Duration::from_secs(2), events.recv()).await;
    }

    let state = screen.state().await;
    if state.items.is_empty() {
        println!("(no todos)");
    }
    for item in &state.items {
        let mark = if item.completed { "x" } else { " " };
        println!("[{mark}] {}  {}", item.id, item.text);
    }

    screen.unmount().await;
    Ok(())
}
