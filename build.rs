// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn update_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("url")
            .short('u')
            .long("url")
            .value_name("URL")
            .env("OTA_UPDATER_URL")
            .required(true)
            .help("Base URL of the update server"),
    )
    .arg(
        Arg::new("properties")
            .long("properties")
            .value_name("PATH")
            .default_value("/system/build.prop")
            .help("Build property file describing the installed build"),
    )
    .arg(
        Arg::new("package_path")
            .long("package-path")
            .value_name("PATH")
            .default_value("/data/ota_package/update.zip")
            .help("Where downloaded packages are written"),
    )
    .arg(
        Arg::new("keyring")
            .long("keyring")
            .value_name("PATH")
            .default_value("/etc/ota-updater/keyring.pgp")
            .help("OpenPGP keyring trusted to sign packages"),
    )
    .arg(
        Arg::new("engine")
            .long("engine")
            .value_name("PROGRAM")
            .default_value("update_engine_client")
            .help("Update engine front-end program"),
    )
    .arg(
        Arg::new("marker")
            .long("marker")
            .value_name("PATH")
            .default_value("/run/reboot-required")
            .help("Pending-reboot marker written after a successful update"),
    )
    .arg(db_path_arg())
}

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value("/var/lib/ota-updater/journal.db")
        .help("Run journal database path")
}

fn build_cli() -> Command {
    Command::new("ota-updater")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ota-updater Contributors")
        .about("Over-the-air system update client")
        .subcommand_required(false)
        .subcommand(update_args(
            Command::new("check").about("Check for an update once and apply it"),
        ))
        .subcommand(
            update_args(
                Command::new("daemon").about("Check periodically until an update has been applied"),
            )
            .arg(
                Arg::new("interval_secs")
                    .long("interval-secs")
                    .value_name("SECONDS")
                    .default_value("21600")
                    .help("Seconds between checks"),
            ),
        )
        .subcommand(
            Command::new("locate")
                .about("Show where the payload lives inside a local package")
                .arg(Arg::new("package_path").required(true).help("Path to the package"))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the layout as JSON"),
                ),
        )
        .subcommand(
            Command::new("history")
                .about("Show the update run journal")
                .arg(db_path_arg())
                .arg(
                    Arg::new("limit")
                        .short('n')
                        .long("limit")
                        .default_value("20")
                        .help("Number of runs to show"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the runs as JSON"),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("ota-updater.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
