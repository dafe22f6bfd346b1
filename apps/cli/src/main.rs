use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use storyloom_core_sdk::{
    config::AppConfig,
    db::{self, Connection},
    keys::{self, mask_secret},
    models::{CreativeDirection, CredentialEntry, GenerationMode, RewriteScope},
    prompt::PromptInput,
    server,
    session::{CredentialCheck, GenerationService},
    telemetry,
};

/**
 * \brief CLI 程序入口。
 */
#[derive(Parser, Debug)]
#[command(name = "storyloom", version, about = "StoryLoom story writer with multi-key failover")]
struct Cli {
    /** \brief 覆盖 STORYLOOM_DB */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 管理 API Key 凭据池。
     */
    Keys {
        #[command(subcommand)]
        action: KeysCommand,
    },

    /**
     * \brief 管理故事、片段与角色。
     */
    Story {
        #[command(subcommand)]
        action: StoryCommand,
    },

    /**
     * \brief 生成一次：续写或改写。
     */
    Generate {
        story_id: i64,
        #[command(flatten)]
        opts: GenerateOpts,
        /** \brief 会话 ID（同一会话共享轮询下标与上下文） */
        #[arg(long, default_value = "cli")]
        session: String,
    },

    /**
     * \brief 交互式写作：每行输入作为本轮要求，/help 查看命令。
     */
    Compose {
        story_id: i64,
        #[command(flatten)]
        direction: DirectionArgs,
    },

    /**
     * \brief 开关遥测日志。
     */
    Telemetry {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /** \brief 新增凭据，keys 可用逗号或空白分隔多把 */
    Add {
        name: String,
        keys: String,
        #[arg(long)]
        id: Option<String>,
        /** \brief OpenAI 兼容接口地址（需同时指定 --model） */
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    List,
    Remove {
        id: String,
    },
    /** \brief 切换单把密钥的启用状态 */
    Toggle {
        id: String,
        index: usize,
    },
    /** \brief 调整优先级 */
    Move {
        id: String,
        position: usize,
    },
    UseDefault {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Import {
        path: PathBuf,
    },
    /** \brief 单独检测一条凭据 */
    Check {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum StoryCommand {
    New {
        title: String,
    },
    List,
    Show {
        id: i64,
    },
    Rename {
        id: i64,
        title: String,
    },
    Delete {
        id: i64,
    },
    /** \brief 追加一段手写内容 */
    Append {
        id: i64,
        content: String,
    },
    /** \brief 移动片段到新位置（0 起） */
    Move {
        segment_id: i64,
        position: usize,
    },
    /** \brief 为故事添加角色 */
    Character {
        id: i64,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ScopeArg {
    Story,
    Chapter,
}

#[derive(Args, Debug, Clone)]
struct DirectionArgs {
    #[arg(long)]
    genre: Option<String>,
    #[arg(long)]
    tone: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    pov: Option<String>,
    #[arg(long)]
    instructions: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct GenerateOpts {
    /** \brief 改写而非续写 */
    #[arg(long, value_enum)]
    rewrite: Option<ScopeArg>,
    /** \brief 章节改写的目标片段 */
    #[arg(long)]
    segment: Option<i64>,
    #[arg(long)]
    prompt: Option<String>,
    /** \brief 把改写结果写回故事 */
    #[arg(long, default_value_t = false)]
    apply: bool,
    #[command(flatten)]
    direction: DirectionArgs,
}

impl DirectionArgs {
    fn to_direction(&self, conn: &Connection, story_id: i64) -> Result<CreativeDirection> {
        Ok(CreativeDirection {
            genre: self.genre.clone(),
            tone: self.tone.clone(),
            style: self.style.clone(),
            point_of_view: self.pov.clone(),
            instructions: self.instructions.clone(),
            characters: db::list_characters(conn, story_id).context("load characters failed")?,
        })
    }
}

impl GenerateOpts {
    fn mode(&self) -> GenerationMode {
        match self.rewrite {
            None => GenerationMode::Continue,
            Some(ScopeArg::Story) => GenerationMode::Rewrite(RewriteScope::EntireStory),
            Some(ScopeArg::Chapter) => GenerationMode::Rewrite(RewriteScope::SelectedChapter),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("read configuration failed")?;
    if let Some(db_path) = cli.db {
        config.db_path = db_path;
    }
    let conn = db::open_db(&config.db_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = match config.telemetry_override {
        Some(forced) => forced,
        None => db::get_telemetry_enabled(&conn).unwrap_or(false),
    };
    telemetry::init(telemetry_enabled, config.log_dir.clone());

    match cli.command {
        Commands::Keys { action } => run_keys(&conn, &config, action).await?,
        Commands::Story { action } => run_story(&conn, action)?,
        Commands::Generate {
            story_id,
            opts,
            session,
        } => {
            let service = GenerationService::from_config(&config)?;
            let cancel = cancel_on_ctrl_c();
            let (content, segment_id) =
                generate_once(&service, &conn, &session, story_id, &opts, &cancel).await?;
            println!("{}", content);
            if let Some(id) = segment_id {
                eprintln!("(saved as segment {})", id);
            }
        }
        Commands::Compose {
            story_id,
            direction,
        } => {
            let service = GenerationService::from_config(&config)?;
            compose(&service, &conn, story_id, direction).await?;
        }
        Commands::Telemetry { enabled } => {
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Serve { addr } => {
            let state = server::AppState::from_config(&config)?;
            server::run(&addr, state).await?;
        }
    }

    Ok(())
}

/**
 * \brief Ctrl-C 时取消生成；令牌被取消后监听任务随之退出。
 */
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    token.cancel();
                }
            }
        }
    });
    cancel
}

fn print_entry(index: usize, entry: &CredentialEntry) {
    let route = match (&entry.endpoint, &entry.model_id) {
        (Some(endpoint), Some(model)) => format!("{} [{}]", endpoint, model),
        (None, None) => "native".to_string(),
        _ => "incomplete endpoint".to_string(),
    };
    println!("#{} {} id={} ({})", index, entry.name, entry.id, route);
    for (i, key) in entry.keys.iter().enumerate() {
        let mark = if entry.active_indexes.contains(&i) { "*" } else { " " };
        let shown = if entry.is_default { "<built-in>".to_string() } else { mask_secret(key) };
        println!("   {} [{}] {}", mark, i, shown);
    }
}

async fn run_keys(conn: &Connection, config: &AppConfig, action: KeysCommand) -> Result<()> {
    match action {
        KeysCommand::Add {
            name,
            keys: raw,
            id,
            endpoint,
            model,
        } => {
            let secrets = keys::parse_raw_keys(&raw);
            if secrets.is_empty() {
                bail!("no API key found in input");
            }
            if endpoint.is_some() != model.is_some() {
                bail!("--endpoint and --model must be given together");
            }
            let id = id.unwrap_or_else(keys::new_entry_id);
            let mut entry = CredentialEntry::new(id.clone(), name, secrets);
            entry.endpoint = endpoint;
            entry.model_id = model;
            let count = entry.keys.len();
            db::insert_key_entry(conn, entry).context("save key failed")?;
            println!("Saved key id={} ({} secret(s))", id, count);
        }
        KeysCommand::List => {
            let list = effective_keys(conn, config.default_key_available())?;
            if list.is_empty() {
                println!("No keys configured.");
            }
            if db::get_use_default_key(conn)? && !config.default_key_available() {
                println!("(default key enabled but no shared secret is configured)");
            }
            for (index, entry) in list.iter().enumerate() {
                print_entry(index, entry);
            }
        }
        KeysCommand::Remove { id } => {
            db::delete_key_entry(conn, &id)?;
            println!("Removed key id={}", id);
        }
        KeysCommand::Toggle { id, index } => {
            let active = db::toggle_key(conn, &id, index)?;
            println!(
                "Key id={} #{} is now {}",
                id,
                index,
                if active { "active" } else { "inactive" }
            );
        }
        KeysCommand::Move { id, position } => {
            db::move_key_entry(conn, &id, position)?;
            println!("Moved key id={} to position {}", id, position);
        }
        KeysCommand::UseDefault { enabled } => {
            db::set_use_default_key(conn, enabled)?;
            println!("Default key {}", if enabled { "enabled" } else { "disabled" });
        }
        KeysCommand::Export { output } => {
            let json = db::export_key_pool(conn)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("write {} failed", path.display()))?;
                    println!("Exported keys to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        KeysCommand::Import { path } => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {} failed", path.display()))?;
            let count = db::import_key_pool(conn, &raw)?;
            println!("Imported {} key(s)", count);
        }
        KeysCommand::Check { id } => {
            let entry = effective_keys(conn, config.default_key_available())?
                .into_iter()
                .find(|e| e.id == id)
                .with_context(|| format!("key id {} not found", id))?;
            let service = GenerationService::from_config(config)?;
            let cancel = cancel_on_ctrl_c();
            match service.check_credential(&entry, &cancel).await {
                Ok(CredentialCheck::Working { reply }) => {
                    println!("OK {}: {}", entry.name, reply.trim())
                }
                Ok(CredentialCheck::Skipped(reason)) => {
                    println!("SKIPPED {}: {}", entry.name, reason)
                }
                Err(e) => println!("FAILED {}: {}", entry.name, e),
            }
        }
    }
    Ok(())
}

fn run_story(conn: &Connection, action: StoryCommand) -> Result<()> {
    match action {
        StoryCommand::New { title } => {
            let id = db::create_story(conn, title.trim()).context("create story failed")?;
            println!("Created story id={}", id);
        }
        StoryCommand::List => {
            for story in db::list_stories(conn)? {
                println!("{}\t{}\t{}", story.id, story.title, story.created_at);
            }
        }
        StoryCommand::Show { id } => {
            let story = db::get_story(conn, id)?.with_context(|| format!("story {} not found", id))?;
            println!("# {}", story.title);
            for character in db::list_characters(conn, id)? {
                println!("- {} {}", character.name, character.description);
            }
            for segment in db::load_segments(conn, id)? {
                println!("\n[{}:{}]\n{}", segment.position, segment.id, segment.content);
            }
        }
        StoryCommand::Rename { id, title } => {
            db::rename_story(conn, id, title.trim())?;
            println!("Renamed story id={}", id);
        }
        StoryCommand::Delete { id } => {
            db::delete_story(conn, id)?;
            println!("Deleted story id={}", id);
        }
        StoryCommand::Append { id, content } => {
            let segment_id = db::append_segment(conn, id, &content)?;
            println!("Appended segment id={}", segment_id);
        }
        StoryCommand::Move {
            segment_id,
            position,
        } => {
            db::move_segment(conn, segment_id, position)?;
            println!("Moved segment id={} to {}", segment_id, position);
        }
        StoryCommand::Character {
            id,
            name,
            description,
        } => {
            let character_id = db::insert_character(conn, id, name.trim(), description.trim())?;
            println!("Added character id={}", character_id);
        }
    }
    Ok(())
}

/**
 * \brief 读取参与轮询的凭据；默认凭据没有共享密钥时不加入。
 */
fn effective_keys(conn: &Connection, default_key_available: bool) -> Result<Vec<CredentialEntry>> {
    let pool = db::load_key_pool(conn).context("load keys failed")?;
    let use_default = db::get_use_default_key(conn)? && default_key_available;
    Ok(keys::effective_key_list(&pool, use_default))
}

/**
 * \brief 执行一次生成并按模式写回：续写追加片段，改写仅在 apply 时覆盖。
 */
async fn generate_once(
    service: &GenerationService,
    conn: &Connection,
    session_id: &str,
    story_id: i64,
    opts: &GenerateOpts,
    cancel: &CancellationToken,
) -> Result<(String, Option<i64>)> {
    if db::get_story(conn, story_id)?.is_none() {
        bail!("story {} not found", story_id);
    }
    let mode = opts.mode();
    let keys = effective_keys(conn, service.default_key_available())?;
    let story_text = db::story_text(conn, story_id)?;
    let chapter = match mode {
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            let segment_id = opts.segment.context("--segment is required for chapter rewrite")?;
            let segment = db::get_segment(conn, segment_id)?
                .filter(|s| s.story_id == story_id)
                .with_context(|| format!("segment {} not found in story {}", segment_id, story_id))?;
            Some(segment.content)
        }
        _ => None,
    };
    let direction = opts.direction.to_direction(conn, story_id)?;
    let input = PromptInput {
        mode,
        story_text: &story_text,
        chapter: chapter.as_deref(),
        user_prompt: opts.prompt.as_deref(),
        direction: &direction,
    };
    telemetry::log_event(
        "cli.generate",
        &format!("session={} story={} mode={:?} keys={}", session_id, story_id, mode, keys.len()),
    );
    let outcome = service
        .generate(session_id, &keys, &input, cancel)
        .await?;

    let segment_id = match mode {
        GenerationMode::Continue => Some(db::append_segment(conn, story_id, &outcome.content)?),
        GenerationMode::Rewrite(_) if !opts.apply => None,
        GenerationMode::Rewrite(RewriteScope::EntireStory) => {
            Some(db::replace_story_text(conn, story_id, &outcome.content)?)
        }
        GenerationMode::Rewrite(RewriteScope::SelectedChapter) => {
            let segment_id = opts.segment.context("--segment is required for chapter rewrite")?;
            db::update_segment(conn, segment_id, &outcome.content)?;
            Some(segment_id)
        }
    };
    Ok((outcome.content, segment_id))
}

const COMPOSE_HELP: &str = "Enter a line to continue the story with that request (empty line = plain continue).
  /rewrite [request]             rewrite the whole story and save it
  /chapter <segment> [request]   rewrite one segment and save it
  /reset                         start a fresh conversation from the first key
  /show                          print the story
  /quit                          leave";

/**
 * \brief 交互式写作循环；会话状态在进程内保留。
 */
async fn compose(
    service: &GenerationService,
    conn: &Connection,
    story_id: i64,
    direction: DirectionArgs,
) -> Result<()> {
    let story = db::get_story(conn, story_id)?.with_context(|| format!("story {} not found", story_id))?;
    let session_id = format!("compose-{}", story_id);
    println!("Composing \"{}\". Type /help for commands.", story.title);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        let mut opts = GenerateOpts {
            rewrite: None,
            segment: None,
            prompt: None,
            apply: true,
            direction: direction.clone(),
        };
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/help", _) => {
                println!("{}", COMPOSE_HELP);
                continue;
            }
            ("/reset", _) => {
                service.reset_session(&session_id).await;
                println!("Session reset.");
                continue;
            }
            ("/show", _) => {
                println!("{}", db::story_text(conn, story_id)?);
                continue;
            }
            ("/rewrite", rest) => {
                opts.rewrite = Some(ScopeArg::Story);
                opts.prompt = Some(rest.to_string());
            }
            ("/chapter", rest) => {
                let (segment, request) = rest.split_once(' ').unwrap_or((rest, ""));
                let Ok(segment) = segment.trim().parse::<i64>() else {
                    println!("usage: /chapter <segment> [request]");
                    continue;
                };
                opts.rewrite = Some(ScopeArg::Chapter);
                opts.segment = Some(segment);
                opts.prompt = Some(request.to_string());
            }
            _ => opts.prompt = Some(line.to_string()),
        }

        let cancel = cancel_on_ctrl_c();
        let _watch = cancel.clone().drop_guard();
        match generate_once(service, conn, &session_id, story_id, &opts, &cancel).await {
            Ok((content, _)) => println!("\n{}\n", content),
            Err(e) => println!("error: {:#}", e),
        }
    }
    Ok(())
}
