use std::fs;

use clap::CommandFactory;
use clap_complete::{generate_to, Shell};

#[path = "src/cli.rs"]
mod cli;

const SHELLS: [Shell; 5] = [
    Shell::Zsh,
    Shell::Bash,
    Shell::Fish,
    Shell::PowerShell,
    Shell::Elvish,
];

fn main() {
    if std::env::var_os("OUT_DIR").is_none() {
        println!("No OUT_DIR defined to store completion files.");
        std::process::exit(1);
    }
    fs::create_dir_all("completion_scripts").unwrap();

    let mut cmd = cli::Cli::command();
    let name = cmd.get_name().to_string();
    for shell in SHELLS {
        generate_to(shell, &mut cmd, name.clone(), "completion_scripts").unwrap();
    }
}
