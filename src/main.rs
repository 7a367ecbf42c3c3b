use cachestore::cli;

fn main() -> anyhow::Result<()> {
    if let Err(e) = cli::run() {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use cachestore::cli::{CachestoreCli, Command};

    #[test]
    fn remove_command_collects_function_names() {
        let cli = CachestoreCli::parse_from([
            "cachestore",
            "--root",
            "target/store",
            "remove",
            "pipeline.load",
            "square",
        ]);
        match cli.command() {
            Command::Remove { functions, all } => {
                assert_eq!(functions, &["pipeline.load", "square"]);
                assert!(!all);
            }
            other => panic!("expected remove command, got {other:?}"),
        }
    }

    #[test]
    fn remove_requires_names_or_all() {
        assert!(CachestoreCli::try_parse_from(["cachestore", "remove"]).is_err());
        let cli = CachestoreCli::parse_from(["cachestore", "remove", "--all"]);
        assert!(matches!(cli.command(), Command::Remove { all: true, .. }));
    }
}
