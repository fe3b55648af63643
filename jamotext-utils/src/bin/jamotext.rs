use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use stdinout::OrExit;

use jamotext::io::format_float;
use jamotext::jamo::hangul_to_jaso;
use jamotext::prelude::*;
use jamotext_utils::{init_logging, open_input, training_args};

static DEFAULT_CLAP_SETTINGS: &[AppSettings] = &[
    AppSettings::DontCollapseArgsInUsage,
    AppSettings::UnifiedHelpMessage,
    AppSettings::SubcommandRequiredElseHelp,
];

fn main() {
    let matches = parse_args();
    init_logging(matches.occurrences_of("verbose"));

    match matches.subcommand() {
        ("skipgram", Some(sub)) => train(ModelKind::SkipGram, sub),
        ("cbow", Some(sub)) => train(ModelKind::Cbow, sub),
        ("supervised", Some(sub)) => train(ModelKind::Supervised, sub),
        ("quantize", Some(sub)) => quantize(sub),
        ("test", Some(sub)) => test(sub),
        ("predict", Some(sub)) => predict(sub, false),
        ("predict-prob", Some(sub)) => predict(sub, true),
        ("print-word-vectors", Some(sub)) => print_word_vectors(sub),
        ("print-sentence-vectors", Some(sub)) => print_sentence_vectors(sub),
        ("print-ngrams", Some(sub)) => print_ngrams(sub),
        ("nn", Some(sub)) => nn(sub),
        ("analogies", Some(sub)) => analogies(sub),
        _ => unreachable!(),
    }
}

fn parse_args() -> ArgMatches<'static> {
    let train_flags = |sub: App<'static, 'static>| {
        sub.arg(
            Arg::with_name("input")
                .long("input")
                .value_name("FILE")
                .help("Training data file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("output")
                .long("output")
                .value_name("PREFIX")
                .help("Output file prefix (writes PREFIX.bin and PREFIX.vec)")
                .takes_value(true)
                .required(true),
        )
        .arg(flag("dim", "Size of word vectors"))
        .arg(flag("ws", "Size of the context window"))
        .arg(flag("epoch", "Number of epochs"))
        .arg(flag("minCount", "Minimal number of word occurrences"))
        .arg(flag("minCountLabel", "Minimal number of label occurrences"))
        .arg(flag("neg", "Number of negatives sampled"))
        .arg(flag("wordNgrams", "Max length of word n-grams"))
        .arg(flag("loss", "Loss function: ns, hs or softmax"))
        .arg(flag("bucket", "Number of subword hash buckets"))
        .arg(flag("minn", "Min length of char n-grams"))
        .arg(flag("maxn", "Max length of char n-grams"))
        .arg(flag("thread", "Number of threads"))
        .arg(flag("lr", "Learning rate"))
        .arg(flag("lrUpdateRate", "Rate of learning rate updates"))
        .arg(flag("t", "Sampling threshold"))
        .arg(flag("label", "Label prefix"))
        .arg(flag(
            "scheme",
            "Subword scheme: classic, consonant, vowel-ablation or syllable-ablation",
        ))
        .arg(flag(
            "pretrainedVectors",
            "Pretrained word vectors for initialization (.vec)",
        ))
        .arg(
            Arg::with_name("jaso")
                .long("jaso")
                .help("Decompose Hangul syllables into jamo before training"),
        )
    };

    App::new("jamotext")
        .settings(DEFAULT_CLAP_SETTINGS)
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .multiple(true)
                .help("Increase logging verbosity"),
        )
        .subcommand(train_flags(
            SubCommand::with_name("skipgram").about("Train a skipgram model"),
        ))
        .subcommand(train_flags(
            SubCommand::with_name("cbow").about("Train a cbow model"),
        ))
        .subcommand(train_flags(
            SubCommand::with_name("supervised").about("Train a supervised classifier"),
        ))
        .subcommand(
            SubCommand::with_name("quantize")
                .about("Compress a supervised model with product quantization")
                .arg(model_arg())
                .arg(
                    Arg::with_name("output")
                        .long("output")
                        .value_name("PREFIX")
                        .help("Output file prefix (writes PREFIX.ftz)")
                        .takes_value(true)
                        .required(true),
                )
                .arg(flag("cutoff", "Keep only this many input rows"))
                .arg(flag("dsub", "Size of each sub-vector"))
                .arg(Arg::with_name("qnorm").long("qnorm").help("Quantize the norm separately"))
                .arg(Arg::with_name("qout").long("qout").help("Quantize the output matrix"))
                .arg(Arg::with_name("retrain").long("retrain").help("Fine-tune after cutoff"))
                .arg(flag("data", "Training data file, required with --retrain"))
                .arg(flag("epoch", "Retraining epochs"))
                .arg(flag("lr", "Retraining learning rate"))
                .arg(flag("thread", "Retraining threads")),
        )
        .subcommand(
            eval_command("test", "Evaluate a classifier on labeled data")
                .arg(flag("k", "Number of predicted labels")),
        )
        .subcommand(
            eval_command("predict", "Print the most likely labels")
                .arg(flag("k", "Number of predicted labels")),
        )
        .subcommand(
            eval_command("predict-prob", "Print the most likely labels with probabilities")
                .arg(flag("k", "Number of predicted labels")),
        )
        .subcommand(
            SubCommand::with_name("print-word-vectors")
                .about("Print vectors for words read from standard input")
                .arg(model_arg())
                .arg(jaso_arg()),
        )
        .subcommand(
            SubCommand::with_name("print-sentence-vectors")
                .about("Print vectors for sentences read from standard input")
                .arg(model_arg())
                .arg(jaso_arg()),
        )
        .subcommand(
            SubCommand::with_name("print-ngrams")
                .about("Print subword n-grams and vectors of a word")
                .arg(model_arg())
                .arg(Arg::with_name("word").index(2).required(true))
                .arg(jaso_arg()),
        )
        .subcommand(
            SubCommand::with_name("nn")
                .about("Nearest-neighbour queries")
                .arg(model_arg())
                .arg(Arg::with_name("word").index(2).help("Query word (stdin when absent)"))
                .arg(flag("k", "Number of neighbours"))
                .arg(jaso_arg()),
        )
        .subcommand(
            SubCommand::with_name("analogies")
                .about("Analogy queries a - b + c")
                .arg(model_arg())
                .arg(Arg::with_name("a").index(2).required(true))
                .arg(Arg::with_name("b").index(3).required(true))
                .arg(Arg::with_name("c").index(4).required(true))
                .arg(flag("k", "Number of results"))
                .arg(jaso_arg()),
        )
        .get_matches()
}

fn flag(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name).long(name).help(help).takes_value(true)
}

fn model_arg() -> Arg<'static, 'static> {
    Arg::with_name("model")
        .help("Model file (.bin or .ftz)")
        .index(1)
        .required(true)
}

fn jaso_arg() -> Arg<'static, 'static> {
    Arg::with_name("jaso")
        .long("jaso")
        .help("Decompose Hangul in the query into jamo")
}

fn eval_command(name: &'static str, about: &'static str) -> App<'static, 'static> {
    SubCommand::with_name(name)
        .about(about)
        .arg(model_arg())
        .arg(
            Arg::with_name("data")
                .index(2)
                .help("Labeled data file (- for standard input)"),
        )
        .arg(jaso_arg())
}

fn load_model(matches: &ArgMatches) -> FastText {
    let path = matches.value_of("model").unwrap();
    FastText::load_model(Path::new(path)).or_exit("Cannot load model", 1)
}

fn parse_k(matches: &ArgMatches) -> usize {
    matches
        .value_of("k")
        .map(|v| v.parse().or_exit("Cannot parse --k", 1))
        .unwrap_or(1)
}

fn maybe_jaso(matches: &ArgMatches, text: &str) -> String {
    if matches.is_present("jaso") {
        hangul_to_jaso(text)
    } else {
        text.to_owned()
    }
}

/// Decompose a training corpus into jamo, line by line, next to the
/// output prefix.
fn decompose_corpus(input: &Path, output_prefix: &str) -> PathBuf {
    let reader = BufReader::new(File::open(input).or_exit("Cannot open training data", 1));
    let path = PathBuf::from(format!("{}.jaso", output_prefix));
    let mut writer =
        BufWriter::new(File::create(&path).or_exit("Cannot create decomposed corpus", 1));
    for line in reader.lines() {
        let line = line.or_exit("Cannot read training data", 1);
        writeln!(writer, "{}", hangul_to_jaso(&line)).or_exit("Cannot write decomposed corpus", 1);
    }
    path
}

fn train(model: ModelKind, matches: &ArgMatches) {
    let args = training_args(model, matches);
    let input = PathBuf::from(matches.value_of("input").unwrap());
    let output = matches.value_of("output").unwrap();

    let corpus = if matches.is_present("jaso") {
        decompose_corpus(&input, output)
    } else {
        input
    };
    let pretrained = matches.value_of("pretrainedVectors").map(PathBuf::from);

    let model = FastText::train_with(
        args,
        &corpus,
        pretrained.as_deref(),
        CancelToken::new(),
    )
    .or_exit("Training failed", 1);

    model
        .save_model(Path::new(&format!("{}.bin", output)))
        .or_exit("Cannot save model", 1);
    model
        .save_vectors(Path::new(&format!("{}.vec", output)))
        .or_exit("Cannot save vectors", 1);
}

fn quantize(matches: &ArgMatches) {
    let model = load_model(matches);
    let mut options = QuantizeOptions {
        qnorm: matches.is_present("qnorm"),
        qout: matches.is_present("qout"),
        retrain: matches.is_present("retrain"),
        ..QuantizeOptions::default()
    };
    if let Some(cutoff) = matches.value_of("cutoff") {
        options.cutoff = cutoff.parse().or_exit("Cannot parse --cutoff", 1);
    }
    if let Some(dsub) = matches.value_of("dsub") {
        options.dsub = dsub.parse().or_exit("Cannot parse --dsub", 1);
    }
    if let Some(epoch) = matches.value_of("epoch") {
        options.epoch = epoch.parse().or_exit("Cannot parse --epoch", 1);
    }
    if let Some(lr) = matches.value_of("lr") {
        options.lr = lr.parse().or_exit("Cannot parse --lr", 1);
    }
    if let Some(thread) = matches.value_of("thread") {
        options.thread = thread.parse().or_exit("Cannot parse --thread", 1);
    }

    let data = matches.value_of("data").map(PathBuf::from);
    let quantized = model
        .quantize(&options, data.as_deref())
        .or_exit("Cannot quantize model", 1);

    let output = matches.value_of("output").unwrap();
    quantized
        .save_model(Path::new(&format!("{}.ftz", output)))
        .or_exit("Cannot save quantized model", 1);
}

fn test(matches: &ArgMatches) {
    let model = load_model(matches);
    let k = parse_k(matches);
    let reader = open_input(matches.value_of("data"));
    let info = if matches.is_present("jaso") {
        let decomposed: Vec<String> = reader
            .lines()
            .map(|l| l.map(|l| hangul_to_jaso(&l)))
            .collect::<std::result::Result<_, _>>()
            .or_exit("Cannot read test data", 1);
        model.test(std::io::Cursor::new(decomposed.join("\n")), k)
    } else {
        model.test(reader, k)
    }
    .or_exit("Evaluation failed", 1);
    println!("{}", info);
}

fn predict(matches: &ArgMatches, print_prob: bool) {
    let model = load_model(matches);
    let k = parse_k(matches);
    let reader = open_input(matches.value_of("data"));
    for line in reader.lines() {
        let line = line.or_exit("Cannot read input line", 1);
        let line = maybe_jaso(matches, &line);
        let predictions = model.predict_line(&line, k).or_exit("Prediction failed", 1);
        let mut first = true;
        for (label, probability) in predictions {
            if !first {
                print!(" ");
            }
            print!("{}", label);
            if print_prob {
                print!(" {}", format_float(probability, 5));
            }
            first = false;
        }
        println!();
    }
}

fn print_word_vectors(matches: &ArgMatches) {
    let model = load_model(matches);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.or_exit("Cannot read word", 1);
        for word in line.split_whitespace() {
            let word = maybe_jaso(matches, word);
            print!("{}", word);
            for v in model.word_vector(&word).iter() {
                print!(" {}", format_float(*v, 5));
            }
            println!();
        }
    }
}

fn print_sentence_vectors(matches: &ArgMatches) {
    let model = load_model(matches);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.or_exit("Cannot read sentence", 1);
        let line = maybe_jaso(matches, &line);
        let vec = model
            .sentence_vector(&line)
            .or_exit("Cannot compute sentence vector", 1);
        let components: Vec<String> = vec.iter().map(|v| format_float(*v, 5)).collect();
        println!("{}", components.join(" "));
    }
}

fn print_ngrams(matches: &ArgMatches) {
    let model = load_model(matches);
    let word = maybe_jaso(matches, matches.value_of("word").unwrap());
    let ngrams = model.ngram_vectors(&word).or_exit("Cannot compute n-grams", 1);
    for (ngram, _id, vec) in ngrams {
        print!("{}", ngram);
        for v in vec.iter() {
            print!(" {}", format_float(*v, 5));
        }
        println!();
    }
}

fn print_neighbours(results: Vec<(String, f32)>) {
    for (word, similarity) in results {
        println!("{} {}", word, format_float(similarity, 5));
    }
}

fn nn(matches: &ArgMatches) {
    let model = load_model(matches);
    let k = parse_k(matches);
    match matches.value_of("word") {
        Some(word) => {
            let word = maybe_jaso(matches, word);
            print_neighbours(model.nn(k, &word).or_exit("Query failed", 1));
        }
        None => {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = line.or_exit("Cannot read query word", 1);
                let word = maybe_jaso(matches, line.trim());
                if word.is_empty() {
                    continue;
                }
                print_neighbours(model.nn(k, &word).or_exit("Query failed", 1));
            }
        }
    }
}

fn analogies(matches: &ArgMatches) {
    let model = load_model(matches);
    let k = parse_k(matches);
    let a = maybe_jaso(matches, matches.value_of("a").unwrap());
    let b = maybe_jaso(matches, matches.value_of("b").unwrap());
    let c = maybe_jaso(matches, matches.value_of("c").unwrap());
    print_neighbours(model.analogies(k, &a, &b, &c).or_exit("Query failed", 1));
}
