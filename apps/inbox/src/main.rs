use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_config, ChatSession, ClientEvent, HttpConversationApi, MissingViewport,
};
use shared::domain::ConversationId;
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides server_url from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    /// Conversation to open immediately.
    #[arg(long)]
    open: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut config = load_config();
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }

    let api = Arc::new(HttpConversationApi::new(&config.server_url, &args.token));
    let session = ChatSession::new(config, api, Arc::new(MissingViewport));
    session.start(&args.token).await?;

    for conversation in session.conversations().await {
        println!(
            "{}  {}  unread={}",
            conversation.conversation_id, conversation.counterpart.name, conversation.unread_count
        );
    }

    if let Some(open) = args.open {
        let conversation_id = ConversationId(open);
        session.open_conversation(&conversation_id).await?;
        for message in session.window(&conversation_id).await {
            println!("[{}] {}: {}", message.sent_at, message.sender_id, message.body);
        }
    }

    let mut events = session.subscribe_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Channel(event)) => {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Ok(ClientEvent::StateChanged(state)) => {
                    println!("connection: {state:?}");
                }
                Ok(ClientEvent::Error(message)) => {
                    warn!("channel error: {message}");
                }
                Err(_) => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}
