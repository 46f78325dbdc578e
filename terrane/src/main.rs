use anyhow::{bail, Context as _, Result};
use clap::{CommandFactory as _, Parser, Subcommand};
use std::{io::stdout, path::PathBuf};
use terrane::{
    application::{and_cleanup, handle_result, parse_variables, registry, runtime, walk_options},
    apply::apply,
    cancel::set_up_process_interrupt_handler,
    config::Configuration,
    graph::walk::WalkOptions,
    logging,
    options::Options,
    plan::{
        planner::{plan, PlanOptions},
        Plan, PlanMode,
    },
    report,
};
use terrane_core::addr::AddrFilter;
use terrane_state::store::StateStore;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "terrane", &mut stdout());
            Ok(())
        }
        command => {
            let mut logger = logging::set_up(logging::Options {
                verbose: args.options.verbose,
                color: args.options.color,
            })?;
            let r = runtime().block_on(run_command(&args.options, command));
            and_cleanup(r, logger.tear_down())
        }
    }
}

async fn run_command(options: &Options, command: &Commands) -> Result<()> {
    let walk = walk_options(options, set_up_process_interrupt_handler()?);
    match command {
        Commands::Plan(a) => plan_command(options, &walk, a).await,
        Commands::Apply { plan, config } => {
            apply_command(options, &walk, plan.as_ref(), config).await
        }
        Commands::Destroy { config } => {
            let args = PlanArgs {
                config: config.clone(),
                destroy: true,
                ..Default::default()
            };
            apply_plan_of(options, &walk, &args).await
        }
        Commands::State(State::List { addr }) => {
            let filter = addr
                .as_deref()
                .map(str::parse::<AddrFilter>)
                .transpose()
                .context("parsing the address filter")?;
            let store = StateStore::open_file(&options.state)?;
            for addr in store.load().list(filter.as_ref()) {
                println!("{}", addr);
            }
            Ok(())
        }
        Commands::ShowPlan { plan } => {
            let plan = Plan::load(plan)?;
            report::write_plan(&mut stdout(), &plan)?;
            Ok(())
        }
        Commands::GenerateMan | Commands::GenerateMarkdown | Commands::GenerateCompletion { .. } => {
            bail!("not a run command")
        }
    }
}

/// Compute a plan against the state file.
async fn compute_plan(
    options: &Options,
    walk: &WalkOptions,
    args: &PlanArgs,
) -> Result<(Configuration, StateStore, Plan)> {
    let config = Configuration::load(&args.config)?;
    let store = StateStore::open_file(&options.state)?;
    let mode = match (args.destroy, args.refresh_only) {
        (true, true) => bail!("--destroy and --refresh-only cannot be combined"),
        (true, false) => PlanMode::Destroy,
        (false, true) => PlanMode::RefreshOnly,
        (false, false) => PlanMode::Normal,
    };
    let plan_options = PlanOptions {
        mode,
        refresh: !args.no_refresh,
        variables: parse_variables(&args.var)?,
    };
    let plan = plan(&config, store.load(), &registry(), &plan_options, walk).await?;
    report::write_plan(&mut stdout(), &plan)?;
    walk.cancel.check()?;
    if plan.diagnostics.has_errors() {
        bail!("planning failed");
    }
    Ok((config, store, plan))
}

async fn plan_command(options: &Options, walk: &WalkOptions, args: &PlanArgs) -> Result<()> {
    let (_, _, plan) = compute_plan(options, walk, args).await?;
    if let Some(out) = &args.out {
        plan.save(out)?;
        eprintln!("Saved the plan to {}", out.display());
    }
    Ok(())
}

async fn apply_command(
    options: &Options,
    walk: &WalkOptions,
    plan_file: Option<&PathBuf>,
    config: &PathBuf,
) -> Result<()> {
    let Some(plan_file) = plan_file else {
        let args = PlanArgs {
            config: config.clone(),
            ..Default::default()
        };
        return apply_plan_of(options, walk, &args).await;
    };
    let plan = Plan::load(plan_file)?;
    let config = Configuration::load(config)?;
    let store = StateStore::open_file(&options.state)?;
    execute(walk, &plan, &config, &store).await
}

async fn apply_plan_of(options: &Options, walk: &WalkOptions, args: &PlanArgs) -> Result<()> {
    let (config, store, plan) = compute_plan(options, walk, args).await?;
    if plan.is_empty() && plan.complete {
        return Ok(());
    }
    execute(walk, &plan, &config, &store).await
}

async fn execute(
    walk: &WalkOptions,
    plan: &Plan,
    config: &Configuration,
    store: &StateStore,
) -> Result<()> {
    let result = apply(plan, config, store, &registry(), walk).await?;
    report::write_apply_result(&mut stdout(), &result)?;
    walk.cancel.check()?;
    if !result.is_success() {
        bail!("apply failed; the state records everything that was applied");
    }
    Ok(())
}

/// Plan and apply declarative infrastructure
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct PlanArgs {
    /// The configuration document
    #[arg(long, default_value = "terrane.json")]
    config: PathBuf,

    /// Save the plan to this file, for `terrane apply`
    #[arg(long)]
    out: Option<PathBuf>,

    /// Plan to delete every object in state
    #[arg(long)]
    destroy: bool,

    /// Only bring the state up to date with the real objects
    #[arg(long)]
    refresh_only: bool,

    /// Do not read objects back before planning
    #[arg(long)]
    no_refresh: bool,

    /// Set a root variable, NAME=VALUE; the value is JSON or a string
    #[arg(long = "var", value_name = "NAME=VALUE")]
    var: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum State {
    /// List the resource instances in state
    List {
        /// Only instances under this module, resource or instance address
        addr: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what applying the configuration would change
    Plan(PlanArgs),

    /// Apply a saved plan, or plan and apply the configuration
    Apply {
        /// A plan saved with `terrane plan --out`
        plan: Option<PathBuf>,

        /// The configuration document
        #[arg(long, default_value = "terrane.json")]
        config: PathBuf,
    },

    /// Delete every object in state
    Destroy {
        /// The configuration document
        #[arg(long, default_value = "terrane.json")]
        config: PathBuf,
    },

    /// Commands that inspect the state
    #[command(subcommand)]
    State(State),

    /// Show a saved plan
    ShowPlan {
        plan: PathBuf,
    },

    /// Generate markdown documentation for terrane
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for terrane
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for terrane
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
