use anyhow::{bail, Context, Result};
use factdeck::commands::{self, ContentState};
use factdeck::services::{LlamaRuntime, ProgressEvent};
use factdeck::{logging, AppConfig};
use std::path::Path;
use std::sync::Arc;

fn progress_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::ModelDownload { progress } => format!("下载模型 {:.0}%", progress * 100.0),
        ProgressEvent::ChunkComplete {
            chunk_index,
            total_chunks,
            facts_extracted,
            ..
        } => format!("分块 {}/{}：{} 条事实", chunk_index + 1, total_chunks, facts_extracted),
        ProgressEvent::QuizProgress {
            batch_index,
            total_batches,
            questions_generated,
            ..
        } => format!("出题 {}/{}：{} 道", batch_index + 1, total_batches, questions_generated),
        other => other.event_type().to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().context("加载配置失败")?;
    logging::init_logging(logging::level_from_env(), None)?;

    let mut args = std::env::args().skip(1);
    let Some(file) = args.next() else {
        bail!("用法: factdeck <文件> [主题]");
    };
    let path = Path::new(&file);
    let topic = args.next().unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "general".to_string())
    });

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("读取文件失败: {}", path.display()))?;

    let runtime = Arc::new(LlamaRuntime::new(&config.model));
    let state = ContentState::new(&config, runtime)?;
    let _progress = state
        .bus
        .subscribe(|event| log::info!("{}", progress_line(event)));

    if config.model.preload_model {
        let status = commands::init_model(&state).await.map_err(anyhow::Error::msg)?;
        log::info!("model state: {}", status.state);
    }

    let imported = commands::import_document(&state, text, topic.clone())
        .await
        .map_err(anyhow::Error::msg)?;
    let quiz = commands::generate_quiz(&state, topic, None)
        .await
        .map_err(anyhow::Error::msg)?;

    println!("{}", serde_json::to_string_pretty(&imported)?);
    println!("{}", serde_json::to_string_pretty(&quiz)?);

    commands::shutdown_model(&state).await.map_err(anyhow::Error::msg)?;
    Ok(())
}
