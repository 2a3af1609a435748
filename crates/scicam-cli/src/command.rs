//! Command-line argument handling for the client commands.

/// Commands offered by tab completion, in the order they are listed.
pub const COMMAND_NAMES: [&str; 7] = [
    "temperature",
    "exposure",
    "status",
    "start",
    "stop",
    "init",
    "kill",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    /// Seconds.
    Exposure(f64),
    /// Degrees C, or `None` to warm up.
    Temperature(Option<f64>),
    /// Frame count, 0 for continuous.
    Start(u32),
    Stop,
    Init,
    Kill,
}

/// Why the arguments did not form a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// No command, or one we do not know: print the general usage.
    Usage,
    /// A known command with bad arguments; print this and return -1.
    Invalid(String),
}

impl Command {
    /// Parse the arguments that follow the config name. `prefix` is used
    /// in usage messages (e.g. `scicam cam1`).
    pub fn parse(prefix: &str, args: &[String]) -> Result<Self, ParseOutcome> {
        let Some((name, rest)) = args.split_first() else {
            return Err(ParseOutcome::Usage);
        };

        match name.as_str() {
            "status" => Ok(Command::Status),
            "stop" => Ok(Command::Stop),
            "init" => Ok(Command::Init),
            "kill" => Ok(Command::Kill),
            "exposure" => match rest {
                [value] => value
                    .parse()
                    .map(Command::Exposure)
                    .map_err(|_| ParseOutcome::Invalid(format!("error: invalid exposure time: {value}"))),
                _ => Err(ParseOutcome::Invalid(format!("usage: {prefix} exposure <seconds>"))),
            },
            "temperature" => match rest {
                [value] if value == "warm" => Ok(Command::Temperature(None)),
                [value] => value
                    .parse()
                    .map(|t| Command::Temperature(Some(t)))
                    .map_err(|_| ParseOutcome::Invalid(format!("error: invalid temperature: {value}"))),
                _ => Err(ParseOutcome::Invalid(format!("usage: {prefix} temperature <degrees>"))),
            },
            "start" => match rest {
                [value] if value == "continuous" => Ok(Command::Start(0)),
                [value] => match value.parse::<u32>() {
                    Ok(count) if count > 0 => Ok(Command::Start(count)),
                    _ => Err(ParseOutcome::Invalid(format!(
                        "error: invalid exposure count: {value}"
                    ))),
                },
                _ => Err(ParseOutcome::Invalid(format!(
                    "usage: {prefix} start <continuous|(count)>"
                ))),
            },
            _ => Err(ParseOutcome::Usage),
        }
    }
}

/// Shell completion candidates for `args`, the words after `completion`.
pub fn completion(args: &[String]) -> Vec<&'static str> {
    // The word list includes `completion` itself
    let words: Vec<&str> = std::iter::once("completion")
        .chain(args.iter().map(String::as_str))
        .collect();
    let recent = &words[words.len().saturating_sub(2)..];

    if recent.contains(&"start") {
        vec!["continuous"]
    } else if recent.contains(&"temperature") {
        vec!["warm"]
    } else if words.len() < 3 {
        COMMAND_NAMES.to_vec()
    } else {
        Vec::new()
    }
}

pub fn usage(prefix: &str) -> String {
    format!(
        "usage: {prefix} <command> [<args>]

general commands:
   status       print a human-readable summary of the camera status
   exposure     set exposure time in seconds
   start        start an exposure sequence

engineering commands:
   init         connect to and initialize the camera
   temperature  set target temperature and enable cooling
   kill         disconnect from the camera
"
    )
}
