//! resp-pipeline: command-line RESP client
//!
//! With a command on the command line, runs it and prints the reply.
//! Otherwise reads one command per line from stdin, pipelines them all
//! over a single connection and prints replies in order as they arrive.
//!
//! Replies are printed the way redis-cli prints them.

use std::time::Duration;

use resp_pipeline::config::Config;
use resp_pipeline::{Client, Error, Frame, ReplyFuture, Request};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        addr = %config.client.addr,
        request_timeout = ?config.client.request_timeout,
        channel_capacity = config.client.pipeline.channel_capacity,
        "Connecting"
    );

    let client = Client::connect(config.client.clone()).await?;

    if config.command.is_empty() {
        run_stdin(client, config.client.request_timeout).await?;
    } else {
        let reply = client
            .call::<Frame>(Request::from_tokens(&config.command))
            .await;
        print_reply(reply)?;
    }

    Ok(())
}

/// Pipeline every stdin line as a command; a separate task prints replies.
async fn run_stdin(client: Client, timeout: Option<Duration>) -> Result<(), Error> {
    let (tx, rx) = mpsc::channel::<ReplyFuture<Frame>>(1024);
    let printer = tokio::spawn(print_replies(client.clone(), rx, timeout));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0usize;
    while let Some(line) = lines.next_line().await? {
        let request = Request::from_tokens(line.split_whitespace());
        if request.is_empty() {
            continue;
        }
        let reply = client.submit::<Frame>(request).await?;
        submitted += 1;
        if tx.send(reply).await.is_err() {
            // Printer stopped on a connection fault.
            break;
        }
    }
    drop(tx);
    debug!(submitted, "Stdin exhausted");

    printer.await.map_err(|_| Error::Closed)?
}

async fn print_replies(
    client: Client,
    mut rx: mpsc::Receiver<ReplyFuture<Frame>>,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    while let Some(reply) = rx.recv().await {
        let result = match timeout {
            Some(limit) => reply.timeout(limit).await,
            None => reply.await,
        };
        if matches!(result, Err(Error::Timeout)) {
            client.pipeline().abort(Error::Timeout);
        }
        print_reply(result)?;
    }
    Ok(())
}

/// Server errors are printed like any other reply; fatal errors end the run.
fn print_reply(reply: Result<Frame, Error>) -> Result<(), Error> {
    match reply {
        Ok(frame) => println!("{frame}"),
        Err(Error::Server(message)) => println!("(error) {message}"),
        Err(err) => return Err(err),
    }
    Ok(())
}
