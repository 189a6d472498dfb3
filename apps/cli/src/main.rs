use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use promptdeck_core_sdk::{
    architect::ArchitectSession,
    client::ProviderClient,
    config::Session,
    db, fanout,
    models::{
        AspectRatio, ChatMessage, ChatRequest, Conversation, ImageRequest, MediaPayload,
        ResolutionTier, Role, UpscaleRequest, VideoRequest,
    },
    server,
    sse::Finish,
    storyboard::{Storyboard, StoryboardOptions},
    telemetry,
};

/**
 * \brief CLI 程序入口：提示词架构师、歌词分镜、多模型对比与媒体生成。
 */
#[derive(Parser, Debug)]
#[command(name = "promptdeck", version, about = "PromptDeck generative studio CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 保存 API Key 与默认模型。
     */
    Init {
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        api_base: Option<String>,
        #[arg(long)]
        text_model: Option<String>,
        #[arg(long)]
        image_model: Option<String>,
        #[arg(long)]
        video_model: Option<String>,
        #[arg(long)]
        upscale_model: Option<String>,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /** \brief 清除已保存的 API Key。 */
    Logout,

    /**
     * \brief 发送一条用户消息并流式显示模型回复（Ctrl-C 停止）。
     */
    Chat {
        #[arg(long)]
        chat_id: Option<i64>,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
    },

    /**
     * \brief 交互式提示词架构师，空行退出。
     * \details 每轮写入数据库；指定 chat_id 时从已有历史继续。
     */
    Architect {
        #[arg(long)]
        chat_id: Option<i64>,
        #[arg(long)]
        model: Option<String>,
    },

    /** \brief 同一提示词并发发送给多个模型。 */
    Compare {
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
    },

    /** \brief 文生图。 */
    Image {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "1:1")]
        aspect: String,
        #[arg(long, default_value = "1K")]
        tier: String,
        #[arg(long)]
        style: Option<String>,
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long, default_value = "image.png")]
        out: PathBuf,
    },

    /** \brief 图生视频（beta）。 */
    Video {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 5)]
        duration: u32,
        #[arg(long, default_value = "16:9")]
        aspect: String,
        #[arg(long, default_value = "video.mp4")]
        out: PathBuf,
    },

    /** \brief 放大图片。 */
    Upscale {
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value_t = 2)]
        scale: u32,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long, default_value = "upscaled.png")]
        out: PathBuf,
    },

    /** \brief 视觉分析：描述一张图片。 */
    Describe {
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value = "Describe this image in detail.")]
        question: String,
        #[arg(long)]
        model: Option<String>,
    },

    /** \brief 歌词分镜：每段生成一张图，可选转为视频。 */
    Storyboard {
        #[arg(long)]
        lyrics: PathBuf,
        #[arg(long, default_value = "16:9")]
        aspect: String,
        #[arg(long, default_value = "1K")]
        tier: String,
        #[arg(long)]
        style: Option<String>,
        #[arg(long, default_value = "storyboard")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = false)]
        animate: bool,
        #[arg(long, default_value_t = 5)]
        duration: u32,
    },

    /** \brief 列出 Provider 模型。 */
    Models,

    /** \brief 探测 Provider 能力。 */
    Capabilities,

    /**
     * \brief 启动本地 HTTP 网关。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

/**
 * \brief 进程内唯一的 Ctrl-C 监听。
 * \details 有进行中的轮次时只取消该轮；空闲（如等待输入）时退出进程。
 */
#[derive(Clone, Default)]
struct Interrupt {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupt {
    fn install() -> Self {
        let interrupt = Self::default();
        let watcher = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !watcher.cancel_turn() {
                    println!();
                    std::process::exit(130);
                }
            }
        });
        interrupt
    }

    /** \brief 取消进行中的轮次；空闲时返回 false。 */
    fn cancel_turn(&self) -> bool {
        match self.current.lock().ok().and_then(|mut g| g.take()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut guard) = self.current.lock() {
            *guard = Some(token.clone());
        }
        token
    }

    fn end_turn(&self) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = None;
        }
    }
}

fn print_delta(delta: &str) {
    print!("{}", delta);
    std::io::stdout().flush().ok();
}

fn lookup_aspect(label: &str) -> Result<AspectRatio> {
    AspectRatio::find(label).ok_or_else(|| {
        let known: Vec<String> = AspectRatio::presets().into_iter().map(|a| a.label).collect();
        anyhow!("unknown aspect {} (known: {})", label, known.join(", "))
    })
}

fn lookup_tier(label: &str) -> Result<ResolutionTier> {
    ResolutionTier::find(label).ok_or_else(|| anyhow!("unknown resolution tier {}", label))
}

fn read_image(path: &Path) -> Result<MediaPayload> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(MediaPayload::from_bytes(&bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    let store = db::SqliteStore::open_default().context("open settings store failed")?;
    let session = Session::load(&store).context("load settings failed")?;

    match cli.command {
        Commands::Init {
            api_key,
            api_base,
            text_model,
            image_model,
            video_model,
            upscale_model,
            enable_telemetry,
        } => {
            let mut next = Session::new(
                api_base.as_deref().unwrap_or(&session.api_base),
                &api_key,
            );
            next.text_model = text_model.unwrap_or(session.text_model);
            next.image_model = image_model.unwrap_or(session.image_model);
            next.video_model = video_model.unwrap_or(session.video_model);
            next.upscale_model = upscale_model.unwrap_or(session.upscale_model);
            next.save(&store).context("save settings failed")?;
            db::set_telemetry_enabled(&conn, enable_telemetry).context("save telemetry failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Saved settings (base={} | key={} | text={} | image={})",
                next.api_base,
                next.masked_key().unwrap_or_default(),
                next.text_model,
                next.image_model
            );
        }
        Commands::Logout => {
            Session::forget_key(&store).context("clear api key failed")?;
            println!("API key removed");
        }
        Commands::Chat {
            chat_id,
            prompt,
            model,
            system,
        } => {
            let client = ProviderClient::new(&session)?;
            let chat_id = match chat_id {
                Some(id) => {
                    db::get_chat(&conn, id)
                        .context("load chat failed")?
                        .with_context(|| format!("chat {} not found", id))?;
                    id
                }
                None => {
                    let title: String = prompt.chars().take(40).collect();
                    let model = model.clone().unwrap_or_else(|| session.text_model.clone());
                    let id = db::create_chat(&conn, &title, &model).context("create chat failed")?;
                    println!("Created chat id={} (model={})", id, model);
                    id
                }
            };
            let model = match model {
                Some(m) => m,
                None => db::get_chat(&conn, chat_id)?
                    .map(|c| c.model)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| session.text_model.clone()),
            };

            db::insert_message(&conn, chat_id, Role::User, &prompt)
                .context("insert user message failed")?;
            let mut messages = Vec::new();
            if let Some(sys) = system.as_deref() {
                messages.push(ChatMessage::system(sys));
            }
            messages.extend(db::load_messages(&conn, chat_id).context("load messages failed")?);

            telemetry::log_event(
                "cli.chat",
                &format!("model={} chat_id={} prompt_len={}", model, chat_id, prompt.len()),
            );

            let interrupt = Interrupt::install();
            let cancel = interrupt.begin_turn();
            let req = ChatRequest::new(model, messages);
            let completion = client
                .stream_chat_with(&req, &cancel, print_delta)
                .await
                .context("stream error")?;
            interrupt.end_turn();
            println!();
            if completion.finish == Finish::Cancelled {
                eprintln!("(stopped)");
            }

            if !completion.text.is_empty() {
                db::insert_message(&conn, chat_id, Role::Assistant, &completion.text)
                    .context("insert assistant message failed")?;
            }
        }
        Commands::Architect { chat_id, model } => {
            let client = ProviderClient::new(&session)?;
            let model = model.unwrap_or_else(|| session.text_model.clone());
            let (chat_id, history) = match chat_id {
                Some(id) => {
                    db::get_chat(&conn, id)
                        .context("load chat failed")?
                        .with_context(|| format!("chat {} not found", id))?;
                    let history = db::load_messages(&conn, id).context("load messages failed")?;
                    println!("Resuming chat id={} ({} messages)", id, history.len());
                    (id, history)
                }
                None => {
                    let id = db::create_chat(&conn, "Prompt architect", &model)
                        .context("create chat failed")?;
                    println!("Created chat id={} (model={})", id, model);
                    (id, Vec::new())
                }
            };
            let mut architect = ArchitectSession::new(model)
                .with_conversation(Conversation::from_messages(history));

            let interrupt = Interrupt::install();
            let stdin = std::io::stdin();
            loop {
                print!("> ");
                std::io::stdout().flush().ok();
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 || line.trim().is_empty() {
                    break;
                }
                let text = line.trim();
                let cancel = interrupt.begin_turn();
                let result = architect.ask(&client, text, &cancel, print_delta).await;
                interrupt.end_turn();
                match result {
                    Ok(completion) => {
                        println!();
                        if completion.finish == Finish::Cancelled {
                            eprintln!("(stopped)");
                        }
                        db::insert_message(&conn, chat_id, Role::User, text)
                            .context("insert user message failed")?;
                        if !completion.text.is_empty() {
                            db::insert_message(&conn, chat_id, Role::Assistant, &completion.text)
                                .context("insert assistant message failed")?;
                        }
                    }
                    Err(e) if e.is_auth() => return Err(e.into()),
                    Err(e) => eprintln!("\nerror: {}", e),
                }
            }
        }
        Commands::Compare {
            models,
            prompt,
            system,
        } => {
            let client = ProviderClient::new(&session)?;
            let slots = fanout::compare_models(
                &client,
                &models,
                &[ChatMessage::user(prompt)],
                system.as_deref(),
            )
            .await;
            for slot in slots {
                println!("=== {}", slot.key);
                match slot.outcome {
                    Ok(text) => println!("{}\n", text),
                    Err(e) => println!("error: {}\n", e),
                }
            }
        }
        Commands::Image {
            prompt,
            model,
            aspect,
            tier,
            style,
            steps,
            out,
        } => {
            let client = ProviderClient::new(&session)?;
            let dims = lookup_aspect(&aspect)?.scaled(&lookup_tier(&tier)?);
            let req = ImageRequest {
                model: model.unwrap_or(session.image_model),
                prompt,
                width: dims.width,
                height: dims.height,
                steps,
                format: Some("png".to_string()),
                style,
            };
            let media = client.generate_image(&req).await?;
            let n = client.save_media(&media, &out).await?;
            println!(
                "Saved {}x{} image to {} ({} bytes)",
                dims.width,
                dims.height,
                out.display(),
                n
            );
        }
        Commands::Video {
            image,
            prompt,
            model,
            duration,
            aspect,
            out,
        } => {
            let client = ProviderClient::new(&session)?;
            let aspect = lookup_aspect(&aspect)?;
            let image = match read_image(&image)? {
                MediaPayload::Base64(b64) => b64,
                MediaPayload::Url(url) => url,
            };
            let req = VideoRequest {
                model: model.unwrap_or(session.video_model),
                image,
                prompt,
                duration_seconds: duration,
                width: aspect.width,
                height: aspect.height,
            };
            let media = client.image_to_video(&req).await?;
            let n = client.save_media(&media, &out).await?;
            println!("Saved video to {} ({} bytes)", out.display(), n);
        }
        Commands::Upscale {
            image,
            scale,
            model,
            prompt,
            out,
        } => {
            let client = ProviderClient::new(&session)?;
            let image = match read_image(&image)? {
                MediaPayload::Base64(b64) => b64,
                MediaPayload::Url(url) => url,
            };
            let req = UpscaleRequest {
                model: model.unwrap_or(session.upscale_model),
                image,
                scale,
                prompt,
            };
            let media = client.upscale_image(&req).await?;
            let n = client.save_media(&media, &out).await?;
            println!("Saved upscaled image to {} ({} bytes)", out.display(), n);
        }
        Commands::Describe {
            image,
            question,
            model,
        } => {
            let client = ProviderClient::new(&session)?;
            let answer = client
                .analyze_image(
                    &model.unwrap_or(session.text_model),
                    read_image(&image)?,
                    &question,
                )
                .await?;
            println!("{}", answer);
        }
        Commands::Storyboard {
            lyrics,
            aspect,
            tier,
            style,
            out_dir,
            animate,
            duration,
        } => {
            let client = ProviderClient::new(&session)?;
            let text = std::fs::read_to_string(&lyrics)
                .with_context(|| format!("read {}", lyrics.display()))?;
            let board = Storyboard::new(
                &text,
                StoryboardOptions {
                    model: session.image_model.clone(),
                    aspect: lookup_aspect(&aspect)?,
                    tier: lookup_tier(&tier)?,
                    style,
                    steps: None,
                },
            )?;
            println!(
                "{} segments at {}x{}, estimated cost ${:.2}",
                board.segments().len(),
                board.dimensions().width,
                board.dimensions().height,
                board.estimated_cost()
            );

            let rendered = board.render(&client).await;
            for frame in &rendered.frames {
                match &frame.outcome {
                    Ok(media) => {
                        let path = out_dir.join(format!("segment-{:02}.png", frame.key));
                        client.save_media(media, &path).await?;
                        println!("segment {}: {}", frame.key, path.display());
                        if animate {
                            let video = board
                                .animate(&client, frame.key, media, &session.video_model, duration)
                                .await;
                            match video {
                                Ok(v) => {
                                    let vpath =
                                        out_dir.join(format!("segment-{:02}.mp4", frame.key));
                                    client.save_media(&v, &vpath).await?;
                                    println!("segment {}: {}", frame.key, vpath.display());
                                }
                                Err(e) => eprintln!("segment {} video failed: {}", frame.key, e),
                            }
                        }
                    }
                    Err(e) => eprintln!("segment {} failed: {}", frame.key, e),
                }
            }
            if rendered.failed() > 0 {
                eprintln!("{} of {} segments failed", rendered.failed(), rendered.frames.len());
            }
        }
        Commands::Models => {
            let client = ProviderClient::new(&session)?;
            println!("provider: {}", client.api_base());
            for m in client.list_models().await? {
                if m.capabilities.is_empty() {
                    println!("{}\t{}", m.id, m.kind);
                } else {
                    println!("{}\t{}\t{}", m.id, m.kind, m.capabilities.join(","));
                }
            }
        }
        Commands::Capabilities => {
            let client = ProviderClient::new(&session)?;
            let caps = client.probe_capabilities().await?;
            println!(
                "{}: chat={} image={} video={} upscale={} vision={}",
                client.api_base(),
                caps.chat,
                caps.image,
                caps.video,
                caps.upscale,
                caps.vision
            );
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}
