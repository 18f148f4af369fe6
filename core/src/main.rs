use anyhow::{Context, Result};
use clap::Parser;
use clipstack::control;
use clipstack::daemon::Launch;
use clipstack::{Config, Entry, Request, Response, Session, daemon};
use env_logger::{Builder, Env};
use log::info;

#[derive(Parser)]
#[command(name = "clipstack")]
#[command(version)]
#[command(about = "clipboard history with paste-back")]
struct Cli {
    /// Show or hide the history popup, starting the daemon if needed
    #[arg(long)]
    toggle: bool,

    /// Paste entry ID into the focused window
    #[arg(long, value_name = "ID")]
    paste: Option<u64>,

    /// Print the history, pinned entries first
    #[arg(long)]
    list: bool,

    /// Only list text entries containing TEXT
    #[arg(long, value_name = "TEXT", requires = "list")]
    search: Option<String>,

    #[arg(long, value_name = "ID")]
    pin: Option<u64>,

    #[arg(long, value_name = "ID")]
    unpin: Option<u64>,

    #[arg(long, value_name = "ID")]
    delete: Option<u64>,

    /// Clear unpinned history
    #[arg(long)]
    clear: bool,

    /// With --clear, drop pinned entries too
    #[arg(long, requires = "clear")]
    all: bool,

    /// Print the detected session as JSON and exit
    #[arg(long)]
    probe: bool,

    /// Maximum number of unpinned entries the daemon keeps
    #[arg(long, value_name = "N")]
    max: Option<usize>,
}

impl Cli {
    /// The request this invocation forwards, if it is a client command.
    fn request(&self) -> Option<Request> {
        if let Some(id) = self.paste {
            Some(Request::Paste(id))
        } else if self.list {
            Some(Request::Query(self.search.clone()))
        } else if let Some(id) = self.pin {
            Some(Request::Pin(id))
        } else if let Some(id) = self.unpin {
            Some(Request::Unpin(id))
        } else if let Some(id) = self.delete {
            Some(Request::Delete(id))
        } else if self.clear {
            Some(Request::Clear {
                keep_pinned: !self.all,
            })
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if cli.probe {
        println!("{}", serde_json::to_string(&Session::probe())?);
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(max) = cli.max {
        config.capacity = max;
    }

    if let Some(request) = cli.request() {
        let response = control::send(&config.socket_path, &request).await;
        match response {
            Ok(Some(response)) => report(response),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Plain invocation and --toggle both start the daemon or poke it.
    let server = match daemon::launch(&config.socket_path, Session::has_display())? {
        Launch::Forward => {
            control::send(&config.socket_path, &Request::Toggle).await?;
            return Ok(());
        }
        Launch::Serve(server) => server,
    };

    let session = Session::probe();
    info!("detected {:?}", session);
    daemon::run(&config, &session, server).await
}

fn report(response: Response) {
    match response {
        Response::Ok => {}
        Response::Entries { entries } => {
            for listed in &entries {
                println!("{}", list_line(&listed.entry));
            }
        }
        Response::Pasted { outcome } => info!("paste: {:?}", outcome),
        Response::Error { code, message } => {
            eprintln!("Error ({:?}): {}", code, message);
            std::process::exit(1);
        }
    }
}

fn list_line(entry: &Entry) -> String {
    let marker = if entry.pinned { "*" } else { " " };
    format!("{:>6} {} {}", entry.id, marker, entry.summary(80))
}
