use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use deep_research_rs::cli::Args;
use deep_research_rs::llm::{LLMClient, TextGenerator};
use deep_research_rs::outlet::{DiskOutlet, HtmlRenderer};
use deep_research_rs::types::{EventKind, ResearchEvent};
use deep_research_rs::utils::html::truncate_chars;
use deep_research_rs::{ResearchContext, ResearchOutcome, run_research_with_cancel};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let request = args.research_request()?;
    let config = args.into_config()?;

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let llm_client = LLMClient::new(&config.llm)?;
    llm_client.check_connection().await?;
    let llm: Arc<dyn TextGenerator> = Arc::new(llm_client);

    let context = ResearchContext::from_config(&config, llm.clone())?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 收到中断信号，当前步骤完成后停止调研...");
            ctrl_c.cancel();
        }
    });

    println!(
        "🔍 调研目标: {}\n🕒 参考时间: {}",
        request.goal,
        request.research_datetime.format("%Y-%m-%d %H:%M:%S")
    );
    let started = Instant::now();
    let outcome = run_research_with_cancel(
        context,
        &request.goal,
        request.research_datetime,
        config.research.min_steps,
        config.research.max_steps,
        print_event,
        cancel,
    )
    .await?;

    match outcome {
        ResearchOutcome::Completed(report) => {
            let html = if config.render_html {
                let renderer = HtmlRenderer::new(Some(llm), config.target_language);
                Some(renderer.render(&request.goal, &report.essay).await)
            } else {
                None
            };
            let outlet = DiskOutlet::new(&config.output_path, config.target_language);
            outlet.save(&report, html.as_deref())?;
            println!(
                "🎉 调研完成，共{}步，耗时{:.2}秒，输出目录: {}",
                report.state.step,
                started.elapsed().as_secs_f64(),
                outlet.output_dir().display()
            );
        }
        ResearchOutcome::Cancelled(state) => {
            println!(
                "🛑 调研已取消，完成了{}步，收集了{}条知识",
                state.step,
                state.knowledge.active_items().len()
            );
        }
    }
    Ok(())
}

/// 控制台观察者
fn print_event(event: ResearchEvent) {
    match event.event {
        EventKind::BatchSearchStart {
            batch_id,
            sub_goal,
            query_strings,
        } => {
            println!("🔎 [批次{}] 搜索子目标: {}", batch_id, sub_goal);
            for query in query_strings {
                println!("   - {}", query);
            }
        }
        EventKind::BatchSearchComplete {
            batch_id, results, ..
        } => {
            let pages: usize = results.iter().map(|r| r.search_result_pages.len()).sum();
            println!("✓ [批次{}] 搜索完成，找到{}个页面", batch_id, pages);
        }
        EventKind::BatchReadStart { batch_id, pages } => {
            println!("📖 [批次{}] 开始阅读{}个页面", batch_id, pages.len());
        }
        EventKind::BatchReadComplete { batch_id, pages } => {
            println!("✓ [批次{}] 阅读完成，读到{}个页面", batch_id, pages.len());
        }
        EventKind::PageNotAllowedToRead {
            page,
            research_datetime,
        } => {
            println!(
                "⏳ 页面晚于参考时间 {}，不予采信: {}",
                research_datetime.format("%Y-%m-%d"),
                page.url
            );
        }
        EventKind::NewKnowledge { new_items } => {
            println!("💡 新增{}条知识", new_items.len());
            for item in &new_items {
                println!("   - {}", truncate_chars(&item.content, 80));
            }
        }
        EventKind::RefinedKnowledge {
            original_items,
            refined_items,
        } => {
            println!(
                "🔄 知识精炼: {}条 -> {}条",
                original_items.len(),
                refined_items.len()
            );
        }
        EventKind::Reasoning { action, reasoning } => {
            println!("🤔 [{}] {}", action, reasoning);
        }
        EventKind::AgentSelection {
            agent_selection,
            overridden_from,
            ..
        } => {
            if let Some(original) = overridden_from {
                println!("🔀 动作 {} 被改写为 {}", original, agent_selection);
            }
        }
        EventKind::Retrieval {
            query,
            retrieval_result,
        } => {
            println!("📚 检索「{}」返回{}条文档", query, retrieval_result.len());
        }
        EventKind::CodeExecution { code_result } => match &code_result.exception {
            None => println!("🐍 代码执行成功"),
            Some(exception) => println!("🐍 代码执行出现异常: {}", truncate_chars(exception, 200)),
        },
        EventKind::ResearchState { snapshot } => {
            println!(
                "📊 第{}步: 已搜索{}个查询，有效知识{}条",
                snapshot.step,
                snapshot.searched_queries.len(),
                snapshot.knowledge.len()
            );
        }
        EventKind::GenerateEssayStart { .. } => {
            println!("📝 开始撰写调研报告");
        }
        EventKind::GenerateEssayComplete { essay } => {
            println!("✓ 调研报告撰写完成（{}字）", essay.chars().count());
        }
        EventKind::Error { error, fatal, .. } => {
            if fatal {
                eprintln!("❌ 致命错误: {}", error);
            } else {
                eprintln!("⚠️ 错误: {}", error);
            }
        }
        EventKind::Unknown => {}
    }
}
