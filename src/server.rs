use std::io::Write;
use std::time::Duration;

use structopt::StructOpt;
use tokio::io::AsyncBufReadExt;

enum Command {
    /// Request the critical section
    Enter,

    /// Print this node's data structures
    Print,

    /// Send a raw message to one node
    Send {
        id: usize,
        message: ricart::Message,
    },

    /// Send a raw message to every other node
    Broadcast {
        message: ricart::Message,
    },

    Help,

    Exit,
}

fn usage() {
    println!(
        "{}{}{}{}{}{}{}{}",
        "--------------------------------------------------------------\n",
        "Possible commands:\n",
        "enter              | e | 1  -- Enter critical section\n",
        "print              | p | 2  -- Print data structures\n",
        "exit               | q | 3  -- Exit\n",
        "send <ID> <MSG>    | s      -- Send <MSG> to node <ID>\n",
        "broadcast <MSG>    | b      -- Send <MSG> to every node\n",
        "--------------------------------------------------------------",
    );
}

impl std::str::FromStr for Command {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut iter = s.trim().splitn(2, ' ');
        match iter.next() {
        | Some("help") | Some("h") => Ok(Command::Help),
        | Some("enter") | Some("e") | Some("1") => Ok(Command::Enter),
        | Some("print") | Some("p") | Some("2") => Ok(Command::Print),
        | Some("exit") | Some("q") | Some("3") => Ok(Command::Exit),
        | Some("send") | Some("s") => {
            let mut rest = iter.next().ok_or(())?.trim().splitn(2, ' ');
            let id = rest.next()
                .ok_or(())
                .and_then(|id| id.parse().map_err(|_| ()))?;
            let message = rest.next()
                .ok_or(())
                .and_then(|message| message.trim().parse().map_err(|_| ()))?;
            Ok(Command::Send { id, message })
        }
        | Some("broadcast") | Some("b") => {
            iter.next()
                .ok_or(())
                .and_then(|message| message.trim().parse().map_err(|_| ()))
                .map(|message| Command::Broadcast { message })
        }
        | _ => Err(()),
        }
    }
}

#[derive(StructOpt)]
#[structopt(name = "ricart-node")]
struct Opt {
    /// Unique node ID
    #[structopt(short = "i", long = "id")]
    id: usize,

    /// Membership store (defaults to config<ID>.txt)
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<std::path::PathBuf>,

    /// Timeout between nodes (in milliseconds)
    #[structopt(short = "t", long = "timeout", default_value = "1000")]
    timeout: u64,

    /// Interval between heartbeats (in milliseconds)
    #[structopt(long = "heartbeat", default_value = "5000")]
    heartbeat: u64,

    /// Consecutive missed heartbeats before a node is removed
    #[structopt(long = "misses", default_value = "3")]
    misses: usize,

    /// Connection resets tolerated per inbound connection
    #[structopt(long = "retries", default_value = "5")]
    retries: usize,

    /// Shortest time spent in the critical section (in seconds)
    #[structopt(long = "min-hold", default_value = "3")]
    min_hold: u64,

    /// Longest time spent in the critical section (in seconds)
    #[structopt(long = "max-hold", default_value = "7")]
    max_hold: u64,

    /// Logging verbosity
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,
}

fn setup_logger(id: usize, verbose: u8) -> Result<(), fern::InitError> {
    let level = match verbose {
    | 0 => log::LevelFilter::Info,
    | 1 => log::LevelFilter::Debug,
    | _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(level)
        .chain(fern::log_file(format!("node-{}.log", id))?)
        .apply()?;
    Ok(())
}

fn report(results: Vec<(usize, ricart::Result<ricart::Message>)>) {
    for (id, result) in results {
        match result {
        | Ok(reply) => println!("[RESPONSE]: {} from node {}", reply, id),
        | Err(error) => println!("[ERROR]: node {}: {}", id, error),
        }
    }
}

async fn run(opt: Opt) -> ricart::Result<()> {
    let mut config = ricart::Config::new(opt.id)
        .with_timeout(Duration::from_millis(opt.timeout))
        .with_heartbeat(Duration::from_millis(opt.heartbeat))
        .with_misses(opt.misses)
        .with_retries(opt.retries);

    if let Some(path) = opt.config {
        config = config.with_path(path);
    }

    let (min, max) = (opt.min_hold, std::cmp::max(opt.min_hold, opt.max_hold));
    let section = ricart::Sleep::new(Duration::from_secs(min)..=Duration::from_secs(max));
    let node = config.run(section).await?;
    println!("[RESPONSE]: node {} is up", node.id());

    report(node.announce().await);

    let mut stdout = std::io::stdout();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    usage();

    // Main interaction loop
    loop {
        print!("> ");
        stdout.flush().ok();

        let line = match lines.next_line().await {
        | Ok(Some(line)) => line,
        | Ok(None) => break,
        | Err(error) => {
            println!("[ERROR]: could not read input: {}", error);
            break
        }
        };

        // Attempt to parse command from user input
        let command = match line.parse::<Command>() {
        | Ok(command) => command,
        | Err(())     => {
            println!("[ERROR]: could not parse command");
            continue
        }
        };

        match command {
        | Command::Enter => {
            if node.enter_cs().await {
                println!("[RESPONSE]: requested critical section");
            } else {
                println!("[ERROR]: critical section already requested or executing");
            }
        }
        | Command::Print => println!("{}", node.snapshot()),
        | Command::Send { id, message } => match node.send(id, message).await {
            | Ok(reply) => println!("[RESPONSE]: {}", reply),
            | Err(error) => println!("[ERROR]: {}", error),
        },
        | Command::Broadcast { message } => report(node.broadcast(message).await),
        | Command::Help => usage(),
        | Command::Exit => break,
        }
    }

    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    if let Err(error) = setup_logger(opt.id, opt.verbose) {
        eprintln!("[ERROR]: could not set up logging: {}", error);
        std::process::exit(1);
    }

    if let Err(error) = run(opt).await {
        log::error!("{}", error);
        eprintln!("[ERROR]: {}", error);
        std::process::exit(1);
    }
}
