//! Client execution: input loop, command dispatch and event rendering.

use std::{collections::HashMap, sync::Arc};

use kizuna_shared::time::SystemClock;
use kizuna_sync::{
    ActivitySignal, ChatSession, SessionHandle, SessionParts, SyncConfig, SyncEvent,
    domain::{
        ConversationKey, CredentialProvider, HistoryRepository, NoopPresenceStore, PresenceStore,
        StaticCredential, SubjectId,
    },
    infrastructure::{
        http::{HttpHistoryRepository, HttpPresenceStore},
        transport::WebSocketTransport,
    },
};
use rustyline::{DefaultEditor, error::ReadlineError};
use tokio::sync::{broadcast::error::RecvError, mpsc};

use crate::{
    domain::{Command, fatal_error, parse_command},
    error::ClientError,
    formatter::MessageFormatter,
    ui::{redisplay_prompt, show},
};

/// Everything the client needs to start a session.
#[derive(Clone)]
pub struct ClientOptions {
    pub config: SyncConfig,
    pub subject: SubjectId,
    pub conversation: ConversationKey,
    pub token: String,
    pub history_url: Option<String>,
    pub presence_url: Option<String>,
}

enum Flow {
    Continue,
    Quit,
}

/// Renders timeline entries once, and again only when they change.
struct TimelineView {
    subject: SubjectId,
    conversation: ConversationKey,
    /// Rendered text per entry, keyed by local id when we sent it.
    rendered: HashMap<String, String>,
}

impl TimelineView {
    async fn refresh(&mut self, session: &SessionHandle) -> Result<(), ClientError> {
        let entries = session.timeline(self.conversation.clone()).await?;
        let mut output = String::new();
        for entry in &entries {
            let key = match (entry.local_id(), entry.canonical_id()) {
                (Some(local_id), _) => local_id.to_string(),
                (None, Some(id)) => id.to_string(),
                (None, None) => continue,
            };
            let text = MessageFormatter::format_entry(entry, &self.subject);
            if self.rendered.get(&key) != Some(&text) {
                output.push_str(&text);
                self.rendered.insert(key, text);
            }
        }
        if !output.is_empty() {
            show(&output, &self.subject);
        }
        Ok(())
    }
}

/// Run the terminal client until `/quit`, end of input, or a fatal
/// connection error.
pub async fn run_client(options: ClientOptions) -> Result<(), ClientError> {
    let ClientOptions {
        config,
        subject,
        conversation,
        token,
        history_url,
        presence_url,
    } = options;

    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredential::new(token));
    let history = history_url.map(|url| {
        Arc::new(HttpHistoryRepository::new(url, credentials.clone())) as Arc<dyn HistoryRepository>
    });
    let presence_store: Arc<dyn PresenceStore> = match presence_url {
        Some(url) => Arc::new(HttpPresenceStore::new(url, credentials.clone())),
        None => Arc::new(NoopPresenceStore),
    };
    let has_history = history.is_some();

    tracing::info!(
        "Connecting to {} as '{}' in {}",
        config.connection.url,
        subject,
        conversation
    );
    let session = ChatSession::start(SessionParts {
        config,
        self_subject: subject.clone(),
        transport: Arc::new(WebSocketTransport::new()),
        credentials,
        history,
        presence_store,
        clock: Arc::new(SystemClock),
    })?;
    let mut events = session.subscribe();

    println!(
        "\nYou are '{}' in {}. Type messages and press Enter to send. /help lists commands.\n",
        subject, conversation
    );

    let mut view = TimelineView {
        subject: subject.clone(),
        conversation: conversation.clone(),
        rendered: HashMap::new(),
    };
    if has_history {
        match session.load_history(conversation.clone()).await {
            Ok(_) => view.refresh(&session).await?,
            Err(e) => tracing::warn!("Failed to load history: {}", e),
        }
    }

    let mut input_rx = spawn_readline(subject.clone());
    redisplay_prompt(&subject);

    let result = loop {
        tokio::select! {
            line = input_rx.recv() => {
                let Some(line) = line else {
                    break Ok(());
                };
                match handle_line(&session, &mut view, &line).await {
                    Ok(Flow::Continue) => redisplay_prompt(&subject),
                    Ok(Flow::Quit) => break Ok(()),
                    Err(e) => show(&MessageFormatter::format_error(&e.to_string()), &subject),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(error) = fatal_error(&event) {
                        break Err(error);
                    }
                    if let Err(e) = render_event(&session, &mut view, event).await {
                        tracing::warn!("Failed to render event: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                    view.refresh(&session).await?;
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    if let Err(e) = session.teardown().await {
        tracing::debug!("Session already closed: {}", e);
    }
    result
}

/// Read lines on a blocking thread, as rustyline is synchronous.
fn spawn_readline(subject: SubjectId) -> mpsc::UnboundedReceiver<String> {
    let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };

        let prompt = format!("{}> ", subject);
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        rl.add_history_entry(line).ok();
                        if input_tx.send(line.to_string()).is_err() {
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    tracing::info!("Interrupted");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    tracing::info!("EOF");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });
    input_rx
}

async fn handle_line(
    session: &SessionHandle,
    view: &mut TimelineView,
    line: &str,
) -> Result<Flow, ClientError> {
    session.record_activity(ActivitySignal::Key)?;
    let command = parse_command(line)?;
    if matches!(command, Command::Send(_)) {
        session.notify_typing(view.conversation.clone())?;
    }

    match command {
        Command::Send(content) => {
            session
                .send(view.conversation.clone(), content, vec![])
                .await?;
        }
        Command::Edit { id, content } => session.edit(id, content).await?,
        Command::Delete { id, for_everyone } => session.delete(id, for_everyone).await?,
        Command::Read(id) => session.mark_read(id)?,
        Command::Retry(local_id) => {
            session.retry(local_id).await?;
        }
        Command::React { id, emoji } => session.react(id, emoji).await?,
        Command::History => {
            let count = session.load_history(view.conversation.clone()).await?;
            print!("{}", MessageFormatter::format_history_loaded(count));
            view.refresh(session).await?;
        }
        Command::Who => {
            let subjects = session.online_subjects().await?;
            print!("{}", MessageFormatter::format_who(&subjects, &view.subject));
        }
        Command::Reconnect => session.reconnect()?,
        Command::Help => println!("{}", MessageFormatter::format_help()),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

async fn render_event(
    session: &SessionHandle,
    view: &mut TimelineView,
    event: SyncEvent,
) -> Result<(), ClientError> {
    let subject = view.subject.clone();
    match event {
        SyncEvent::TimelineChanged(conversation) if conversation == view.conversation => {
            view.refresh(session).await?;
        }
        SyncEvent::TimelineChanged(_) => {}
        SyncEvent::ConnectionChanged(state) => {
            show(&MessageFormatter::format_connection(state), &subject);
        }
        SyncEvent::DeliveryFailed {
            local_id,
            conversation,
        } => {
            show(
                &MessageFormatter::format_delivery_failed(&local_id, &conversation),
                &subject,
            );
        }
        SyncEvent::PresenceChanged(changed) if changed != subject => {
            let presence = session.presence(changed.clone()).await?;
            show(&MessageFormatter::format_presence(&changed, &presence), &subject);
        }
        SyncEvent::PresenceChanged(_) => {}
        SyncEvent::TypingChanged(conversation) if conversation == view.conversation => {
            let typers = session.typers(conversation).await?;
            if let Some(line) = MessageFormatter::format_typers(&typers) {
                show(&line, &subject);
            }
        }
        SyncEvent::TypingChanged(_) => {}
        SyncEvent::GroupMembership {
            group_id,
            subject: member,
            joined,
        } => {
            show(
                &MessageFormatter::format_group_membership(&group_id, &member, joined),
                &subject,
            );
        }
        SyncEvent::ThreadUpdated {
            parent,
            reply_count,
        } => {
            show(
                &MessageFormatter::format_thread_updated(&parent, reply_count),
                &subject,
            );
        }
        SyncEvent::AuthenticationFailed(_) | SyncEvent::PersistentFailure { .. } => {}
    }
    Ok(())
}
