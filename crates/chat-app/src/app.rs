use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::chat::{MessageId, Role, StreamReconciler, TranscriptSnapshot};
use crate::settings::ChatSettings;

/// Marker printed after an assistant header while its reply is still empty.
/// The header is printed again once text arrives.
pub const LOADING_MARKER: &str = "...";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShellError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Prompt(String),
    NewChat,
    DismissBanner,
    Quit,
}

impl ShellCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "/new" => Self::NewChat,
            "/dismiss" => Self::DismissBanner,
            "/quit" | "/exit" => Self::Quit,
            _ => Self::Prompt(line.to_string()),
        }
    }
}

/// Opens the configured backend, falling back to an unconfigured reconciler.
pub async fn connect(settings: &ChatSettings) -> StreamReconciler {
    match lumen_llm::create_backend(&settings.provider_id) {
        Ok(backend) => {
            StreamReconciler::connect(
                backend.as_ref(),
                settings.to_provider_config(),
                settings.welcome_message.clone(),
            )
            .await
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to resolve provider backend");
            StreamReconciler::unconfigured(&error)
        }
    }
}

/// Turns successive transcript snapshots into incremental terminal output.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    first_record: Option<MessageId>,
    printed: HashMap<MessageId, String>,
    open_record: Option<MessageId>,
    marked_record: Option<MessageId>,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text needed to bring the terminal up to date with `snapshot`.
    pub fn render(&mut self, snapshot: &TranscriptSnapshot, active: Option<MessageId>) -> String {
        let mut output = String::new();

        let first_record = snapshot.get(0).map(|record| record.id);
        if self.first_record.is_some() && self.first_record != first_record {
            self.close_open_record(&mut output);
            self.printed.clear();
            self.marked_record = None;
            output.push_str("\n--- new chat ---\n");
        }
        self.first_record = first_record;

        for record in snapshot.iter() {
            let is_active = active == Some(record.id);
            match self.printed.get(&record.id) {
                None => {
                    self.close_open_record(&mut output);
                    let _ = write!(output, "\n{}> {}", role_label(record.role), record.text);
                    if is_active && record.text.is_empty() {
                        output.push_str(LOADING_MARKER);
                        self.marked_record = Some(record.id);
                    }
                    self.printed.insert(record.id, record.text.clone());
                    self.open_record = Some(record.id);
                }
                Some(printed) if *printed == record.text => {}
                Some(printed) => {
                    let suffix = record.text.strip_prefix(printed.as_str());
                    match suffix {
                        Some(suffix) if self.marked_record != Some(record.id) => {
                            output.push_str(suffix);
                        }
                        // First text after the marker, or a failed reply's replacement.
                        _ => {
                            self.close_open_record(&mut output);
                            let _ =
                                write!(output, "\n{}> {}", role_label(record.role), record.text);
                            self.open_record = Some(record.id);
                            self.marked_record = None;
                        }
                    }
                    self.printed.insert(record.id, record.text.clone());
                }
            }
        }

        if active.is_none() {
            self.close_open_record(&mut output);
        }
        output
    }

    fn close_open_record(&mut self, output: &mut String) {
        if self.open_record.take().is_some() {
            output.push('\n');
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

/// Line-oriented terminal front end over one chat session.
pub struct TerminalShell {
    reconciler: Arc<StreamReconciler>,
}

impl TerminalShell {
    pub fn new(reconciler: Arc<StreamReconciler>) -> Self {
        Self { reconciler }
    }

    pub async fn run(self) -> Result<(), ShellError> {
        self.run_with(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Drives the session from `input` until `/quit` or end of input.
    ///
    /// At end of input, exchanges still streaming are awaited and rendered before
    /// returning. `/quit` returns at once.
    pub async fn run_with<R, W>(self, input: R, mut output: W) -> Result<(), ShellError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(banner) = self.reconciler.banner() {
            let notice = format!("[!] {banner} (type /dismiss to hide)\n");
            write_flush(&mut output, &notice, "write-banner").await?;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let renderer = tokio::spawn(render_loop(Arc::clone(&self.reconciler), output, stop_rx));
        let mut exchanges = JoinSet::new();
        let mut lines = input.lines();
        let mut quit = false;

        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-prompt-line",
        })? {
            while exchanges.try_join_next().is_some() {}
            match ShellCommand::parse(&line) {
                ShellCommand::Prompt(prompt) => {
                    // Spawned so input stays live while a reply streams.
                    let reconciler = Arc::clone(&self.reconciler);
                    exchanges.spawn(async move { reconciler.send(&prompt).await });
                }
                ShellCommand::NewChat => self.reconciler.new_session(),
                ShellCommand::DismissBanner => self.reconciler.dismiss_banner(),
                ShellCommand::Quit => {
                    quit = true;
                    break;
                }
            }
        }

        if quit {
            exchanges.abort_all();
        }
        while let Some(joined) = exchanges.join_next().await {
            match joined {
                Err(error) if !error.is_cancelled() => {
                    tracing::warn!(error = %error, "exchange task ended abnormally");
                }
                _ => {}
            }
        }

        let _ = stop_tx.send(());
        match renderer.await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(error = %error, "render task ended abnormally");
                Ok(())
            }
        }
    }
}

/// Prints transcript changes until `stop` fires, then renders once more.
async fn render_loop<W>(
    reconciler: Arc<StreamReconciler>,
    mut output: W,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), ShellError>
where
    W: AsyncWrite + Unpin,
{
    let mut transcript = reconciler.subscribe();
    let mut state = reconciler.subscribe_state();
    let mut printer = TranscriptPrinter::new();
    let mut stopping = false;

    loop {
        let rendered = printer.render(&reconciler.snapshot(), reconciler.active_record_id());
        if !rendered.is_empty() {
            write_flush(&mut output, &rendered, "render-transcript").await?;
        }
        if stopping {
            return Ok(());
        }

        tokio::select! {
            changed = transcript.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = &mut stop => stopping = true,
        }
    }
}

async fn write_flush<W>(output: &mut W, text: &str, stage: &'static str) -> Result<(), ShellError>
where
    W: AsyncWrite + Unpin,
{
    output
        .write_all(text.as_bytes())
        .await
        .context(WriteOutputSnafu { stage })?;
    output.flush().await.context(WriteOutputSnafu { stage })
}
