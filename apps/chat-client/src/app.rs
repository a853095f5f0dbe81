//! Console session: reads commands from stdin and prints hub traffic.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use chathub_hub_connection::{ConnectionEvent, HubConnection, StreamHandle};
use chathub_protocol::ChatMessage;
use chathub_protocol::constants::{
    EVENT_NEW_MESSAGE, METHOD_BROADCAST, METHOD_COUNT_DOWN, METHOD_DAD_JOKE,
};

use crate::commands::{self, Command, HELP};
use crate::config::Config;

type ActiveStream = Arc<Mutex<Option<StreamHandle>>>;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut builder = HubConnection::builder(config.url.as_str());
    if config.auto_reconnect {
        builder = builder.with_automatic_reconnect();
    }
    let conn = builder.build();

    conn.on(EVENT_NEW_MESSAGE, |(msg,): (ChatMessage,)| {
        println!("{}: {}", msg.name, msg.text);
    })?;

    // Closed for good: the user has to restart.
    let closed = CancellationToken::new();
    let render = conn.take_events().map(|mut events| {
        let closed = closed.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracing::debug!(?event, "connection event");
                if let Some(text) = commands::describe(&event) {
                    println!("* {text}");
                }
                if matches!(event, ConnectionEvent::Closed { .. }) {
                    closed.cancel();
                }
            }
        })
    });

    conn.start().await?;
    println!("* joined as {}, type /help for commands", config.name);

    let active: ActiveStream = Arc::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("* {e}");
                continue;
            }
        };

        match command {
            Command::Say(text) => {
                let msg = ChatMessage::new(config.name.clone(), text);
                if let Err(e) = conn.send(METHOD_BROADCAST, (msg,)).await {
                    println!("* not sent: {e}");
                }
            }
            Command::Joke => {
                let conn = conn.clone();
                tokio::spawn(async move {
                    match conn.invoke::<String, _>(METHOD_DAD_JOKE, ()).await {
                        Ok(joke) => println!("* joke: {joke}"),
                        Err(e) => println!("* joke failed: {e}"),
                    }
                });
            }
            Command::CountDown(n) => start_countdown(&conn, &active, n).await,
            Command::Cancel => {
                let handle = active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match handle {
                    Some(handle) => {
                        if let Err(e) = conn.cancel_stream(&handle).await {
                            println!("* cancel failed: {e}");
                        }
                    }
                    None => println!("* no countdown running"),
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    // Our own teardown needs no "please restart".
    if let Some(render) = render {
        render.abort();
    }
    conn.stop().await;
    Ok(())
}

async fn start_countdown(conn: &HubConnection, active: &ActiveStream, n: i64) {
    let result = conn
        .stream(
            METHOD_COUNT_DOWN,
            (n,),
            |item: i64| println!("* countdown: {item}"),
            |result| match result {
                Ok(()) => println!("* countdown finished"),
                Err(e) => println!("* countdown ended: {e}"),
            },
        )
        .await;

    match result {
        Ok(handle) => {
            let previous = active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(handle);
            if previous.is_some_and(|h| h.is_active()) {
                println!("* another countdown is still running; /cancel stops the newest");
            }
        }
        Err(e) => println!("* countdown failed: {e}"),
    }
}
