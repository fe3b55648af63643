use std::io::BufRead;

use clap::ArgMatches;
use stdinout::{Input, OrExit};

use jamotext::prelude::*;

/// Open a data argument for reading; `-` or an absent value means
/// standard input.
pub fn open_input(value: Option<&str>) -> Box<dyn BufRead> {
    let value = value.filter(|v| *v != "-").map(ToOwned::to_owned);
    let input: &'static Input = Box::leak(Box::new(Input::from(value)));
    Box::new(input.buf_read().or_exit("Cannot open input for reading", 1))
}

/// Initialize logging from the number of `--verbose` occurrences.
pub fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Build training arguments from the shared training flags.
pub fn training_args(model: ModelKind, matches: &ArgMatches) -> Args {
    let mut args = Args::new(model);

    macro_rules! numeric_flag {
        ($field:ident, $flag:expr) => {
            if let Some(value) = matches.value_of($flag) {
                args.$field = value
                    .parse()
                    .or_exit(format!("Cannot parse --{}", $flag), 1);
            }
        };
    }

    numeric_flag!(dim, "dim");
    numeric_flag!(ws, "ws");
    numeric_flag!(epoch, "epoch");
    numeric_flag!(min_count, "minCount");
    numeric_flag!(min_count_label, "minCountLabel");
    numeric_flag!(neg, "neg");
    numeric_flag!(word_ngrams, "wordNgrams");
    numeric_flag!(bucket, "bucket");
    numeric_flag!(minn, "minn");
    numeric_flag!(maxn, "maxn");
    numeric_flag!(thread, "thread");
    numeric_flag!(lr, "lr");
    numeric_flag!(lr_update_rate, "lrUpdateRate");
    numeric_flag!(t, "t");

    if let Some(label) = matches.value_of("label") {
        args.label = label.to_owned();
    }
    if let Some(loss) = matches.value_of("loss") {
        args.loss = LossKind::from_name(loss).or_exit("Unknown loss", 1);
    }
    if let Some(scheme) = matches.value_of("scheme") {
        args.scheme = match scheme {
            "classic" => SubwordScheme::Classic,
            "consonant" => SubwordScheme::ConsonantOnly,
            "vowel-ablation" => SubwordScheme::VowelAblation,
            "syllable-ablation" => SubwordScheme::SyllableAblation,
            other => {
                eprintln!("Unknown subword scheme: {}", other);
                std::process::exit(1);
            }
        };
    }

    args.finalize().or_exit("Invalid arguments", 1)
}
