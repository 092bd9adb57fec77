mod cli;
mod defaults;
mod paths;
mod report;
mod run;
mod script;
mod sim;

use anyhow::Result;
use cli::{Command, DefaultsAction};
use defaults::{default_config_toml, write_default_config, WriteOptions, WriteOutcome};
use paths::AppPaths;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Command::Run(args) => run::run(args),
        Command::Defaults(defaults_cmd) => handle_defaults_command(defaults_cmd.action),
        Command::Check { config } => run::check(&config),
    }
}

fn handle_defaults_command(action: DefaultsAction) -> Result<()> {
    let paths = AppPaths::discover()?;
    match action {
        DefaultsAction::Where => {
            println!("Directories:");
            println!("  config:   {}", paths.config_dir().display());
            println!("  data:     {}", paths.data_dir().display());
            println!("  reports:  {}", paths.reports_dir().display());
            let config_file = paths.config_file();
            let status = if config_file.exists() {
                "present"
            } else {
                "missing"
            };
            println!("User config: {} ({status})", config_file.display());
            Ok(())
        }
        DefaultsAction::Show => {
            print!("{}", default_config_toml()?);
            Ok(())
        }
        DefaultsAction::Write { force } => {
            let (path, outcome) = write_default_config(&paths, WriteOptions { force })?;
            match outcome {
                WriteOutcome::Installed => println!("Installed default config at {}", path.display()),
                WriteOutcome::Replaced => println!("Replaced config at {}", path.display()),
                WriteOutcome::AlreadyPresent => println!(
                    "Config already present at {}; pass --force to replace it",
                    path.display()
                ),
            }
            Ok(())
        }
    }
}
