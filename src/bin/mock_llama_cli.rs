// Stand-in for llama-cli: echoes each stdin line back followed by a stop marker.
//
// Accepts (and ignores) the regular llama-cli flags. Behaviour is picked with
// `--mock-mode <mode>`:
//   echo     "<line>[end of text]"                      (default)
//   chat     "<line>\n> "
//   chunked  like echo, written in small delayed pieces
//   stall    "<line>" and never a marker
//   exit     "<line>" then exit
//   bytes    "<line>" followed by the invalid UTF-8 bytes FF FE, then "x[end of text]"
// `--mock-banner` prints a loading banner and a first prompt before reading.

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

const END_OF_TEXT: &str = "[end of text]";

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn write_flush(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    out.write_all(bytes)?;
    out.flush()
}

fn write_chunked(out: &mut impl Write, text: &str) -> io::Result<()> {
    for piece in text.as_bytes().chunks(3) {
        write_flush(out, piece)?;
        thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mode = arg_value(&args, "--mock-mode").unwrap_or("echo").to_string();
    let model = arg_value(&args, "-m").unwrap_or("<none>").to_string();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.iter().any(|a| a == "--mock-banner") {
        eprintln!("llama_model_load: loading model from {model}");
        write_flush(&mut out, b"== Running in interactive mode. ==\n> ")?;
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match mode.as_str() {
            "chat" => write_flush(&mut out, format!("{line}\n> ").as_bytes())?,
            "chunked" => {
                write_chunked(&mut out, &line)?;
                write_chunked(&mut out, END_OF_TEXT)?;
            }
            "bytes" => {
                write_flush(&mut out, line.as_bytes())?;
                write_flush(&mut out, b"\xff\xfe")?;
                write_flush(&mut out, format!("x{END_OF_TEXT}").as_bytes())?;
            }
            "stall" => write_flush(&mut out, line.as_bytes())?,
            "exit" => {
                write_flush(&mut out, line.as_bytes())?;
                return Ok(());
            }
            _ => write_flush(&mut out, format!("{line}{END_OF_TEXT}").as_bytes())?,
        }
    }
    Ok(())
}
