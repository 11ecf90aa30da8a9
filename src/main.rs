use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};

use formfill::config::{
    find_default_config, init_default_config, load_config, parse_engine,
    parse_exhaustion_policy, parse_write_mode, AppConfig, JobConfig,
};
use formfill::describe::{describe, to_json};
use formfill::docx::model::DocumentModel;
use formfill::docx::package::TemplatePackage;
use formfill::knowledge::load_knowledge;
use formfill::llm::client_from_config;
use formfill::pipeline::FillPass;
use formfill::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "formfill")]
#[command(about = "Fill DOCX templates from a knowledge base (LLM-guided mapping) with format preservation", long_about = None)]
struct Args {
    /// Generate a default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// Template .docx
    #[arg(value_name = "DOCX")]
    template: Option<PathBuf>,

    /// Knowledge base (.xlsx or .json)
    #[arg(value_name = "KNOWLEDGE")]
    knowledge: Option<PathBuf>,

    /// Output .docx (default: <template_stem>_filled.docx)
    #[arg(short, long, value_name = "DOCX")]
    output: Option<PathBuf>,

    /// Config file path (default: search for formfill.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// LLM engine: ollama | api
    #[arg(long)]
    engine: Option<String>,

    /// Model name (e.g. qwen2.5:14b, gpt-4o-mini)
    #[arg(long)]
    model: Option<String>,

    /// API key for engine = api
    #[arg(long)]
    api_key: Option<String>,

    /// Engine base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Paragraph write policy: overwrite | append
    #[arg(long)]
    write_mode: Option<String>,

    /// Entity policy for repeated blocks: wrap | leave-unassigned
    #[arg(long)]
    exhaustion_policy: Option<String>,

    /// Dump the structural description JSON and exit (no LLM)
    #[arg(long, value_name = "JSON")]
    describe_json: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let progress = ConsoleProgress::new(true);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let Some(template) = args.template.clone() else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nUSAGE:\n  formfill <template.docx> <knowledge.xlsx|knowledge.json>\n\nTIPS:\n  - Default config search: formfill.toml (upwards). Run formfill --init-config to create one.\n  - Use --describe-json outline.json to inspect what the model would see, without calling it.\n"
        );
        return Ok(());
    };

    if let Some(out_json) = args.describe_json.clone() {
        let pkg = TemplatePackage::read_path(&template)?;
        let (model, _parts) = DocumentModel::build(&pkg)?;
        let json = to_json(&describe(&model));
        std::fs::write(&out_json, json)
            .with_context(|| format!("write outline json: {}", out_json.display()))?;
        progress.info(format!("wrote outline: {}", out_json.display()));
        return Ok(());
    }

    let knowledge_path = args
        .knowledge
        .clone()
        .context("missing knowledge base argument (.xlsx or .json)")?;

    let workdir = template
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let app_config = match args.config.clone().or_else(|| find_default_config(&workdir)) {
        Some(path) => {
            progress.info(format!("config: {}", path.display()));
            load_config(&path)?
        }
        None => AppConfig::default(),
    };

    let mut job = JobConfig::from_app_config(&app_config)?;
    if let Some(engine) = args.engine.as_deref() {
        job.engine = parse_engine(engine)?;
    }
    if let Some(model) = args.model.clone() {
        job.model = model;
    }
    if args.api_key.is_some() {
        job.api_key = args.api_key.clone();
    }
    if args.base_url.is_some() {
        job.base_url = args.base_url.clone();
    }
    if let Some(mode) = args.write_mode.as_deref() {
        job.write_mode = parse_write_mode(mode)?;
    }
    if let Some(policy) = args.exhaustion_policy.as_deref() {
        job.exhaustion_policy = parse_exhaustion_policy(policy)?;
    }

    let output = match args.output {
        Some(p) => p,
        None => {
            let stem = template
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output")
                .to_string();
            template.with_file_name(format!("{stem}_filled.docx"))
        }
    };

    let records = load_knowledge(&knowledge_path)?;
    progress.info(format!(
        "knowledge base loaded: {} records from {}",
        records.len(),
        knowledge_path.display()
    ));

    let client = client_from_config(&job)?;
    let pass = FillPass::new(job, client.as_ref(), &progress);
    let summary = pass.run_path(&template, &records, &output)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize summary")?
    );
    progress.info(format!("output written: {}", output.display()));
    Ok(())
}
