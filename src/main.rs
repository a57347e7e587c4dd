use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use gallery::backend::http::HttpBackend;
use gallery::backend::{Backend, BackendError};
use gallery::config::{BackendConfig, ConfigError, GALLERY_BUCKET};
use gallery::services::gallery::{EMPTY_NOTICE, GalleryError, GalleryViewer};
use gallery::services::quick_upload::{QuickUploadError, QuickUploader};
use gallery::services::session::{AuthError, SessionManager};
use gallery::services::upload::{BatchReport, UploadError, UploadFile, UploadPanel, UploadStatus};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Upload(#[from] UploadError),
    #[error("{0}")]
    Gallery(#[from] GalleryError),
    #[error("{0}")]
    QuickUpload(#[from] QuickUploadError),
    #[error("cannot read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("not signed in; run `gallery sign-in` first")]
    NotSignedIn,
}

#[derive(Parser, Debug)]
#[command(name = "gallery", about = "Upload and browse gallery images")]
struct Cli {
    /// Where the session is kept between runs.
    #[arg(long, env = "GALLERY_SESSION_FILE", default_value = ".gallery-session.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account; the profile is created by the backend.
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GALLERY_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        full_name: String,
    },
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GALLERY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Email a passwordless sign-in link.
    MagicLink {
        #[arg(long)]
        email: String,
    },
    SignOut,
    Whoami,
    /// List non-admin users, newest first.
    Users,
    /// Upload images into a user's gallery (admin only).
    Upload {
        #[arg(long)]
        user: Uuid,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Upload portfolio images shown to users without their own (admin only).
    Portfolio {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the signed-in user's gallery.
    Gallery {
        /// Also write a static HTML page here.
        #[arg(long)]
        html: Option<PathBuf>,
    },
    /// Single-file upload to the legacy bucket.
    QuickUpload { file: Option<PathBuf> },
    /// Print the public URL of a stored path.
    Url {
        path: String,
        #[arg(long, default_value = GALLERY_BUCKET)]
        bucket: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = BackendConfig::from_env()?;
    config.session_file = Some(cli.session_file);

    let http = HttpBackend::new(config)?;
    if let Err(e) = http.restore_session().await {
        warn!(error = %e, "ignoring unreadable session file");
    }
    let redirect_url = http.config().redirect_url.clone();
    let backend: Arc<dyn Backend> = Arc::new(http);
    let session = SessionManager::init(backend.clone(), redirect_url).await;

    match cli.command {
        Command::SignUp { email, password, full_name } => {
            let data = session.sign_up(&email, &password, &full_name).await?;
            if data.session.is_some() {
                println!("signed up and signed in as {}", data.user.id);
            } else {
                println!("signed up {}; confirm your email before signing in", data.user.id);
            }
        }
        Command::SignIn { email, password } => {
            let signed_in = session.sign_in(&email, &password).await?;
            println!("signed in as {}", signed_in.user.email.as_deref().unwrap_or(&email));
        }
        Command::MagicLink { email } => {
            session.sign_in_with_magic_link(&email).await?;
            println!("check {email} for a sign-in link");
        }
        Command::SignOut => {
            session.sign_out().await;
            println!("signed out");
        }
        Command::Whoami => {
            let snapshot = session.snapshot();
            let user = snapshot.user.as_ref().ok_or(CliError::NotSignedIn)?;
            let name = snapshot.profile.as_ref().map_or_else(|| user.id.to_string(), |p| p.display_name());
            let role = if snapshot.is_admin() { "admin" } else { "user" };
            println!("{name} <{}> ({role})", user.email.as_deref().unwrap_or("-"));
        }
        Command::Users => {
            let mut panel = UploadPanel::new(backend.clone(), session.reader());
            for profile in panel.load_users().await {
                println!(
                    "{}  {}  {}  {}",
                    profile.id,
                    profile.full_name.as_deref().unwrap_or("No name"),
                    profile.email.as_deref().unwrap_or("-"),
                    profile.created_at.date()
                );
            }
        }
        Command::Upload { user, files } => {
            let files = read_files(&files).await?;
            let mut panel = UploadPanel::new(backend.clone(), session.reader());
            panel.load_users().await;
            let target = panel.select_user(user)?.display_name();
            println!("uploading {} image(s) for {target}", files.len());
            let report = run_with_progress(&mut panel, files, false).await?;
            println!("Successfully uploaded {} image(s)", report.uploaded.len());
        }
        Command::Portfolio { files } => {
            let files = read_files(&files).await?;
            let mut panel = UploadPanel::new(backend.clone(), session.reader());
            run_with_progress(&mut panel, files, true).await?;
            println!("Portfolio images uploaded successfully");
        }
        Command::Gallery { html } => {
            let user_id = session.snapshot().user_id().ok_or(CliError::NotSignedIn)?;
            let viewer = GalleryViewer::new(backend.clone());
            let view = viewer.load(user_id).await?;
            println!("{}", view.title());
            if let Some(notice) = view.notice() {
                println!("{notice}");
            }
            if view.is_empty() {
                println!("{EMPTY_NOTICE}");
            }
            for item in &view.items {
                match &item.image.caption {
                    Some(caption) => println!("{}  {}  {caption}", item.image.file_name, item.url),
                    None => println!("{}  {}", item.image.file_name, item.url),
                }
            }
            if let Some(path) = html {
                tokio::fs::write(&path, view.to_html()).await?;
                println!("wrote {}", path.display());
            }
        }
        Command::QuickUpload { file } => {
            let file = match file {
                Some(path) => Some(UploadFile::from_path(&path).await?),
                None => None,
            };
            let url = QuickUploader::new(backend.clone()).upload(file).await?;
            println!("Image uploaded successfully! {url}");
        }
        Command::Url { path, bucket } => {
            println!("{}", backend.public_url(&bucket, &path));
        }
    }
    Ok(())
}

async fn read_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>, CliError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(UploadFile::from_path(path).await?);
    }
    Ok(files)
}

/// Run a batch while printing progress; Ctrl-C stops it before the next file.
async fn run_with_progress(
    panel: &mut UploadPanel,
    files: Vec<UploadFile>,
    portfolio: bool,
) -> Result<BatchReport, CliError> {
    let cancel = panel.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let progress = tokio::spawn(print_progress(panel.status()));

    let result = if portfolio { panel.upload_portfolio(files).await } else { panel.upload_files(files).await };

    interrupt.abort();
    progress.abort();
    result.map_err(|e| {
        let kept = e.completed().len();
        if kept > 0 {
            eprintln!("{kept} image(s) were uploaded before the batch stopped and remain stored");
        }
        CliError::Upload(e)
    })
}

async fn print_progress(mut status: watch::Receiver<UploadStatus>) {
    while status.changed().await.is_ok() {
        let current = *status.borrow();
        if current.uploading {
            eprintln!("Uploading... {}%", current.progress.round());
        }
    }
}
