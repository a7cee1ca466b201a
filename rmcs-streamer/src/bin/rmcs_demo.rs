//! Demo binary driving the `rmcs_streamer` façade the way a host process
//! would: a plain synchronous `main`, since the façade itself owns its
//! tokio runtime (`spec.md` §1 "the host process' signal handling ... is
//! configuration or glue" — this binary only exercises `Init`/
//! `SwitchCamera`/`Stop`/`GetStatus`/`SetLogFile`, nothing more).

use std::ffi::CString;
use std::io::BufRead;

use clap::Parser;

use rmcs_streamer::ffi;

#[derive(Parser, Debug)]
#[clap(author, about = "Runs the rmcs-streamer control facade against RMCS_MQTT_HOST")]
struct AppArgs {
    /// Camera index to select at startup (falls back to the table default).
    #[clap(long)]
    camera: Option<i32>,

    /// Redirect logs to this file instead of stdout.
    #[clap(long)]
    log_file: Option<String>,
}

fn main() {
    let args = AppArgs::parse();

    if let Some(path) = &args.log_file {
        let c_path = CString::new(path.as_str()).expect("log path must not contain NUL bytes");
        if unsafe { ffi::SetLogFile(c_path.as_ptr()) } != 0 {
            eprintln!("failed to open log file {path}");
            std::process::exit(1);
        }
    }

    match ffi::Init() {
        0 => println!("rmcs-streamer initialized"),
        1 => println!("rmcs-streamer already running"),
        code => {
            eprintln!("Init failed with code {code}");
            std::process::exit(1);
        }
    }

    if let Some(camera) = args.camera {
        match ffi::SwitchCamera(camera) {
            0 => println!("switched to camera {camera}"),
            code => eprintln!("SwitchCamera({camera}) failed with code {code}"),
        }
    }

    println!("status={}. Type 'quit' or send EOF to stop.", ffi::GetStatus());
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(text) if text.trim() == "quit" => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    ffi::Stop();
    println!("rmcs-streamer stopped");
}
