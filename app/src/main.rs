use anyhow::Result;
use clap::Parser;
use smartops_core::{
    telemetry, ClientConfig, ClientState, Provider, ProviderKeys, SnapshotStore, TaskKind,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "SmartOps",
    version,
    about = "Terminal client for the SmartOps diagnostics backend"
)]
struct Cli {
    /// Backend base URL; overrides SMARTOPS_SERVER and smartops.yaml.
    #[arg(long)]
    server: Option<Url>,
    /// Directory for persisted session and history snapshots.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(EnvFilter::from_default_env())?;
    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    if let Some(server) = cli.server {
        config.base_url = server;
    }
    let store = SnapshotStore::new(cli.data_dir.unwrap_or_else(SnapshotStore::default_root));

    let runtime = Runtime::new()?;
    let state = Arc::new(ClientState::new(&config, store)?);

    if state.session().is_authenticated() {
        if let Err(err) = runtime.block_on(state.refresh_from_server()) {
            tracing::warn!(%err, "startup refresh failed");
        }
        if let Some(username) = state.session().username {
            println!("Welcome back, {username}.");
        }
    } else {
        println!("Not logged in. Use /login <user> <password> or /register <user> <password>.");
    }
    println!("Type /help for commands; anything else is sent as a chat turn.");

    repl(&runtime, &state)
}

enum Flow {
    Continue,
    Quit,
}

fn repl(runtime: &Runtime, state: &Arc<ClientState>) -> Result<()> {
    let mut provider = Provider::Deepseek;
    let stdin = io::stdin();
    prompt(state, provider);
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            prompt(state, provider);
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('/') {
            if let Flow::Quit = command(runtime, state, &mut provider, rest) {
                break;
            }
        } else {
            chat_turn(runtime, state, provider, trimmed);
        }
        prompt(state, provider);
    }
    Ok(())
}

fn prompt(state: &ClientState, provider: Provider) {
    let who = state.session().username.unwrap_or_else(|| "anonymous".into());
    print!("{who}@{provider}> ");
    io::stdout().flush().ok();
}

fn command(
    runtime: &Runtime,
    state: &Arc<ClientState>,
    provider: &mut Provider,
    rest: &str,
) -> Flow {
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    match name {
        "quit" | "exit" => return Flow::Quit,
        "help" => help(),
        "login" | "register" => auth(runtime, state, name, args),
        "logout" => {
            state.logout();
            println!("Logged out.");
        }
        "provider" => match args.parse::<Provider>() {
            Ok(parsed) => {
                *provider = parsed;
                println!("Provider set to {parsed}.");
            }
            Err(err) => eprintln!("{err}"),
        },
        "keys" => keys(runtime, state, args),
        "task" => submit_task(runtime, state, *provider, args),
        "continue" => continue_task(runtime, state, args),
        "status" => status(runtime, state, args),
        "history" => history(runtime, state),
        "analyze" => analyze(runtime, state, *provider, args),
        "export" => export(state, args),
        "clear" => {
            state.clear_conversation();
            println!("Conversation cleared.");
        }
        other => eprintln!("Unknown command '/{other}'. Try /help."),
    }
    Flow::Continue
}

fn help() {
    println!("  /login <user> <password>      authenticate");
    println!("  /register <user> <password>   create an account and log in");
    println!("  /logout                       drop the session");
    println!("  /provider <deepseek|tongyi>   select the AI provider");
    println!("  /keys <deepseek> <tongyi>     store provider API keys");
    println!("  /task <content>               submit a diagnostic task");
    println!("  /continue <task-id> <content> follow up on a prior task");
    println!("  /status <task-id> [watch]     fetch or poll a task's status");
    println!("  /history                      refresh and list recent tasks");
    println!("  /analyze <path>               upload a file for analysis");
    println!("  /export [path]                write the conversation as markdown");
    println!("  /clear                        clear the conversation");
    println!("  /quit                         leave");
}

fn auth(runtime: &Runtime, state: &Arc<ClientState>, mode: &str, args: &str) {
    let mut parts = args.split_whitespace();
    let (Some(username), Some(password)) = (parts.next(), parts.next()) else {
        eprintln!("Usage: /{mode} <user> <password>");
        return;
    };
    let outcome = if mode == "login" {
        runtime.block_on(state.login(username, password))
    } else {
        runtime.block_on(state.register(username, password))
    };
    match outcome {
        Ok(()) => println!("Welcome, {username}."),
        Err(err) => eprintln!("{err}"),
    }
}

fn keys(runtime: &Runtime, state: &Arc<ClientState>, args: &str) {
    let mut parts = args.split_whitespace();
    let (Some(deepseek), Some(tongyi)) = (parts.next(), parts.next()) else {
        eprintln!("Usage: /keys <deepseek-key> <tongyi-key>");
        return;
    };
    let keys = ProviderKeys {
        deepseek: deepseek.to_owned(),
        tongyi: tongyi.to_owned(),
    };
    match runtime.block_on(state.save_keys(keys)) {
        Ok(()) => println!("Keys saved."),
        Err(err) => eprintln!("saving keys failed: {err}"),
    }
}

fn chat_turn(runtime: &Runtime, state: &Arc<ClientState>, provider: Provider, content: &str) {
    // Only DeepSeek supports the streamed endpoint.
    if provider == Provider::Deepseek {
        let outcome = runtime.block_on(async {
            let mut chunks = state.send_chat_streaming(provider, content).await?;
            while let Some(item) = chunks.recv().await {
                match item {
                    Ok(chunk) if chunk.done => break,
                    Ok(chunk) => {
                        print!("{}", chunk.delta);
                        io::stdout().flush().ok();
                    }
                    Err(err) => {
                        println!();
                        return Err(err);
                    }
                }
            }
            println!();
            Ok(())
        });
        if let Err(err) = outcome {
            eprintln!("chat failed: {err}");
        }
    } else {
        match runtime.block_on(state.send_chat(provider, content)) {
            Ok(reply) => println!("{reply}"),
            Err(err) => eprintln!("chat failed: {err}"),
        }
    }
}

fn submit_task(runtime: &Runtime, state: &Arc<ClientState>, provider: Provider, content: &str) {
    if content.is_empty() {
        eprintln!("Usage: /task <content>");
        return;
    }
    match runtime.block_on(
        state
            .orchestrator()
            .submit(TaskKind::Generic, provider, content),
    ) {
        Ok(task) => print_task_outcome(&task.id, task.status.as_str(), task.result.as_deref()),
        Err(err) => eprintln!("task submission failed: {err}"),
    }
}

fn continue_task(runtime: &Runtime, state: &Arc<ClientState>, args: &str) {
    let Some((task_id, content)) = args.split_once(char::is_whitespace) else {
        eprintln!("Usage: /continue <task-id> <content>");
        return;
    };
    let Some(task) = state.orchestrator().task(task_id) else {
        eprintln!("No task '{task_id}' in the local list. Try /history first.");
        return;
    };
    let followup = state.orchestrator().continue_from(&task);
    match runtime.block_on(state.orchestrator().submit_followup(&followup, content.trim())) {
        Ok(task) => print_task_outcome(&task.id, task.status.as_str(), task.result.as_deref()),
        Err(err) => eprintln!("follow-up failed: {err}"),
    }
}

fn status(runtime: &Runtime, state: &Arc<ClientState>, args: &str) {
    let mut parts = args.split_whitespace();
    let Some(task_id) = parts.next() else {
        eprintln!("Usage: /status <task-id> [watch]");
        return;
    };
    let watch = parts.next() == Some("watch");
    match state.orchestrator().poll(task_id, watch) {
        Ok(Some((_handle, mut snapshots))) => {
            runtime.block_on(async {
                while let Some(snapshot) = snapshots.recv().await {
                    print_task_outcome(
                        &snapshot.task_id,
                        snapshot.status.as_str(),
                        snapshot.result.as_deref(),
                    );
                }
            });
        }
        Ok(None) => println!("Already polling that task."),
        Err(err) => eprintln!("status query failed: {err}"),
    }
}

fn history(runtime: &Runtime, state: &Arc<ClientState>) {
    if let Err(err) = runtime.block_on(state.refresh_from_server()) {
        eprintln!("history refresh failed: {err}");
        return;
    }
    let tasks = state.tasks();
    if tasks.is_empty() {
        println!("No tasks yet. Start a chat or submit one with /task.");
        return;
    }
    for task in tasks.iter().take(10) {
        println!(
            "{}  {}  {}  {}",
            task.id,
            task.kind.as_str(),
            task.status.as_str(),
            task.description
        );
    }
}

fn analyze(runtime: &Runtime, state: &Arc<ClientState>, provider: Provider, args: &str) {
    if args.is_empty() {
        eprintln!("Usage: /analyze <path>");
        return;
    }
    let path = Path::new(args);
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("cannot read {}: {err}", path.display());
            return;
        }
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.log");
    match runtime.block_on(state.analyze_file(file_name, contents, provider)) {
        Ok(result) => println!("{result}"),
        Err(err) => eprintln!("analysis failed: {err}"),
    }
}

fn export(state: &ClientState, args: &str) {
    let path = if args.is_empty() {
        "smartops-chat.md"
    } else {
        args
    };
    match std::fs::write(path, state.export_markdown()) {
        Ok(()) => println!("Conversation written to {path}."),
        Err(err) => eprintln!("export failed: {err}"),
    }
}

fn print_task_outcome(task_id: &str, status: &str, result: Option<&str>) {
    match result {
        Some(result) => println!("[{task_id}] {status}: {result}"),
        None => println!("[{task_id}] {status}"),
    }
}
