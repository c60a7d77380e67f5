use crate::exporter::GIT_COMMIT_HASH;
use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::{
        PossibleValuesParser,
        styling::{AnsiColor, Effects, Styles},
    },
};

fn seconds(name: &'static str, help: &'static str, default: &'static str, env: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .default_value(default)
        .env(env)
        .value_name("SECONDS")
        .value_parser(clap::value_parser!(u64).range(1..))
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("query_exporter")
        .about("Prometheus exporter for the results of scheduled SQL queries")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(GIT_COMMIT_HASH)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9102")
                .env("QUERY_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("IP address to bind to, default tries [::] then 0.0.0.0")
                .env("QUERY_EXPORTER_LISTEN")
                .value_name("IP"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Query catalogue file")
                .default_value("config.yaml")
                .env("QUERY_EXPORTER_CONFIG")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("secret-store")
                .long("secret-store")
                .help("Where the database credentials document is read from")
                .default_value("file")
                .env("QUERY_EXPORTER_SECRET_STORE")
                .value_parser(PossibleValuesParser::new(["file", "vault"])),
        )
        .arg(
            Arg::new("secret-name")
                .long("secret-name")
                .help("Name of the credentials document in the secret store")
                .default_value("databases.yaml")
                .env("QUERY_EXPORTER_SECRET_NAME"),
        )
        .arg(
            Arg::new("secret-dir")
                .long("secret-dir")
                .help("Directory of the file secret store")
                .default_value(".")
                .env("QUERY_EXPORTER_SECRET_DIR")
                .value_name("DIR"),
        )
        .arg(
            Arg::new("vault-addr")
                .long("vault-addr")
                .help("Vault address")
                .default_value("http://127.0.0.1:8200")
                .env("VAULT_ADDR")
                .value_name("URL"),
        )
        .arg(
            Arg::new("vault-token")
                .long("vault-token")
                .help("Vault token")
                .env("VAULT_TOKEN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("vault-mount")
                .long("vault-mount")
                .help("Vault KV v2 mount")
                .default_value("secret")
                .env("QUERY_EXPORTER_VAULT_MOUNT"),
        )
        .arg(
            Arg::new("vault-field")
                .long("vault-field")
                .help("Field of the Vault secret holding the document")
                .default_value("config")
                .env("QUERY_EXPORTER_VAULT_FIELD"),
        )
        .arg(
            Arg::new("watch")
                .long("watch")
                .help("Where query catalogue changes come from")
                .default_value("file")
                .env("QUERY_EXPORTER_WATCH")
                .value_parser(PossibleValuesParser::new(["file", "consul"])),
        )
        .arg(
            Arg::new("consul-addr")
                .long("consul-addr")
                .help("Consul address")
                .default_value("http://127.0.0.1:8500")
                .env("CONSUL_HTTP_ADDR")
                .value_name("URL"),
        )
        .arg(
            Arg::new("consul-key")
                .long("consul-key")
                .help("Consul KV key holding the query catalogue")
                .default_value("query_exporter/config")
                .env("QUERY_EXPORTER_CONSUL_KEY")
                .value_name("KEY"),
        )
        .arg(seconds(
            "query-timeout",
            "Default query timeout",
            "30",
            "QUERY_EXPORTER_QUERY_TIMEOUT",
        ))
        .arg(seconds(
            "ping-timeout",
            "Timeout of a database ping",
            "5",
            "QUERY_EXPORTER_PING_TIMEOUT",
        ))
        .arg(seconds(
            "health-interval",
            "Period of the per target health check",
            "60",
            "QUERY_EXPORTER_HEALTH_INTERVAL",
        ))
        .arg(seconds(
            "timeout-margin",
            "Added to a query timeout to get its shortest period",
            "10",
            "QUERY_EXPORTER_TIMEOUT_MARGIN",
        ))
        .arg(
            Arg::new("max-concurrent-jobs")
                .long("max-concurrent-jobs")
                .help("Maximum number of queries running at once, 0 for no limit")
                .default_value("0")
                .env("QUERY_EXPORTER_MAX_CONCURRENT_JOBS")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("queue-capacity")
                .long("queue-capacity")
                .help("Capacity of the metric event queue")
                .default_value("1024")
                .env("QUERY_EXPORTER_QUEUE_CAPACITY")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .help("Metric namespace")
                .default_value("sql")
                .env("QUERY_EXPORTER_NAMESPACE"),
        )
        .arg(
            Arg::new("subsystem")
                .long("subsystem")
                .help("Metric subsystem")
                .default_value("exporter")
                .env("QUERY_EXPORTER_SUBSYSTEM"),
        )
        .arg(
            Arg::new("log-file")
                .short('l')
                .long("log-file")
                .help("Append logs to this file instead of the console")
                .env("QUERY_EXPORTER_LOG_FILE")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("QUERY_EXPORTER_PORT", None::<&str>),
                ("QUERY_EXPORTER_CONFIG", None),
                ("QUERY_EXPORTER_SECRET_STORE", None),
                ("QUERY_EXPORTER_WATCH", None),
                ("QUERY_EXPORTER_QUERY_TIMEOUT", None),
                ("VAULT_ADDR", None),
                ("CONSUL_HTTP_ADDR", None),
                ("QUERY_EXPORTER_LOG_FILE", None),
            ],
            || {
                let matches = new().get_matches_from(vec!["query_exporter"]);

                assert!(matches.get_one::<String>("log-file").is_none());
                assert_eq!(matches.get_one::<u16>("port").copied(), Some(9102));
                assert_eq!(
                    matches.get_one::<String>("config").map(String::as_str),
                    Some("config.yaml")
                );
                assert_eq!(
                    matches.get_one::<String>("secret-store").map(String::as_str),
                    Some("file")
                );
                assert_eq!(
                    matches.get_one::<String>("watch").map(String::as_str),
                    Some("file")
                );
                assert_eq!(matches.get_one::<u64>("query-timeout").copied(), Some(30));
                assert_eq!(matches.get_one::<u64>("ping-timeout").copied(), Some(5));
                assert_eq!(matches.get_one::<u64>("health-interval").copied(), Some(60));
                assert_eq!(matches.get_one::<u64>("timeout-margin").copied(), Some(10));
                assert_eq!(matches.get_one::<usize>("max-concurrent-jobs").copied(), Some(0));
                assert_eq!(matches.get_one::<usize>("queue-capacity").copied(), Some(1024));
                assert_eq!(
                    matches.get_one::<String>("vault-addr").map(String::as_str),
                    Some("http://127.0.0.1:8200")
                );
                assert!(matches.get_one::<String>("listen").is_none());
            },
        );
    }

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "query_exporter");
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_flags() {
        let matches = new().get_matches_from(vec![
            "query_exporter",
            "--port",
            "8080",
            "-c",
            "/etc/exporter/queries.yaml",
            "--secret-store",
            "vault",
            "--watch",
            "consul",
            "--max-concurrent-jobs",
            "4",
            "-vv",
        ]);

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(8080));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/etc/exporter/queries.yaml")
        );
        assert_eq!(
            matches.get_one::<String>("secret-store").map(String::as_str),
            Some("vault")
        );
        assert_eq!(
            matches.get_one::<String>("watch").map(String::as_str),
            Some("consul")
        );
        assert_eq!(matches.get_one::<usize>("max-concurrent-jobs").copied(), Some(4));
        assert_eq!(matches.get_count("verbose"), 2);
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("QUERY_EXPORTER_PORT", Some("9999")),
                ("QUERY_EXPORTER_QUERY_TIMEOUT", Some("45")),
                ("CONSUL_HTTP_ADDR", Some("http://consul:8500")),
            ],
            || {
                let matches = new().get_matches_from(vec!["query_exporter"]);

                assert_eq!(matches.get_one::<u16>("port").copied(), Some(9999));
                assert_eq!(matches.get_one::<u64>("query-timeout").copied(), Some(45));
                assert_eq!(
                    matches.get_one::<String>("consul-addr").map(String::as_str),
                    Some("http://consul:8500")
                );
            },
        );
    }

    #[test]
    fn test_log_file() {
        temp_env::with_var("QUERY_EXPORTER_LOG_FILE", Some("/var/log/env.log"), || {
            let matches = new().get_matches_from(vec!["query_exporter"]);
            assert_eq!(
                matches.get_one::<String>("log-file").map(String::as_str),
                Some("/var/log/env.log")
            );

            let matches =
                new().get_matches_from(vec!["query_exporter", "-l", "/var/log/flag.log"]);
            assert_eq!(
                matches.get_one::<String>("log-file").map(String::as_str),
                Some("/var/log/flag.log")
            );
        });
    }

    #[test]
    fn test_rejects_unknown_secret_store() {
        let result = new().try_get_matches_from(vec!["query_exporter", "--secret-store", "s3"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = new().try_get_matches_from(vec!["query_exporter", "--query-timeout", "0"]);
        assert!(result.is_err());
    }
}
