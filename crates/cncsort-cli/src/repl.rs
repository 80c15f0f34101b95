//! REPL – Read-Eval-Print Loop for the sorter shell.
//!
//! Supported slash-commands:
//!   /connect          – connect to the configured controller
//!   /status           – machine, session and store summary
//!   /start            – open a bed-mapping session
//!   /capture          – capture at the current position
//!   /finish           – stitch the session into a bed map
//!   /abort [reason]   – abort the open session
//!   /scan             – automatic grid scan over the workspace
//!   /plan             – show the visit order for pending objects
//!   /pick             – plan and visit every pending object
//!   /move x y z [f]   – rapid move, or linear at feed `f`
//!   /home             – safe height, then the workspace origin corner
//!   /help             – show this list
//!   /quit | /exit     – exit the CLI

use std::path::Path;

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use cncsort_runtime::PickPlan;
use cncsort_types::{MachinePosition, SorterError};

use crate::app::App;

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    Status,
    Start,
    Capture,
    Finish,
    Abort(String),
    Scan,
    Plan,
    Pick,
    Move { target: MachinePosition, feed_rate: Option<f64> },
    Home,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let head = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let cmd = match head {
            "/connect" => Command::Connect,
            "/status" => Command::Status,
            "/start" => Command::Start,
            "/capture" => Command::Capture,
            "/finish" => Command::Finish,
            "/abort" => {
                let reason = args.join(" ");
                Command::Abort(if reason.is_empty() { "operator abort".to_string() } else { reason })
            }
            "/scan" => Command::Scan,
            "/plan" => Command::Plan,
            "/pick" => Command::Pick,
            "/move" => parse_move(&args)?,
            "/home" => Command::Home,
            "/help" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            other => return Err(format!("Unknown command: '{other}'")),
        };
        Ok(cmd)
    }
}

fn parse_move(args: &[&str]) -> Result<Command, String> {
    const USAGE: &str = "usage: /move <x> <y> <z> [feed]";
    if !(3..=4).contains(&args.len()) {
        return Err(USAGE.to_string());
    }
    let nums = args
        .iter()
        .map(|a| a.parse::<f64>().map_err(|_| format!("'{a}' is not a number; {USAGE}")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Command::Move {
        target: MachinePosition::new(nums[0], nums[1], nums[2]),
        feed_rate: nums.get(3).copied(),
    })
}

/// Entry point for the interactive REPL.  Returns on `/quit` or EOF.
pub fn run(app: &mut App) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    let prompt = format!("{} ", "cncsort>".bold().cyan());

    loop {
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "Interrupted. Type /quit to exit.".yellow());
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match Command::parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Ok(cmd) => execute(app, cmd),
            Err(msg) => println!("{} Type {} for available commands.", msg.red(), "/help".bold()),
        }
    }
}

fn execute(app: &mut App, cmd: Command) {
    let archived_before = app.last_archive().map(Path::to_path_buf);
    let result = match cmd {
        Command::Connect => app.connect().map(|p| ok(format!("Connected at {p}"))),
        Command::Status => app.status().map(|s| print_status(&s)),
        Command::Start => app.start().map(|id| ok(format!("Mapping session {} open", id.bold()))),
        Command::Capture => app.capture().map(|c| {
            ok(format!("{} at {} – {} object(s)", c.image_id, c.position, c.object_count))
        }),
        Command::Finish => app.finish().map(|m| {
            ok(format!(
                "Bed map {} complete: {} image(s), {} object(s)",
                m.map_id.bold(),
                m.image_count,
                m.object_count
            ))
        }),
        Command::Abort(reason) => app.abort(&reason).map(|()| ok("Session aborted".to_string())),
        Command::Scan => {
            println!("  Scanning – press Ctrl-C to stop.");
            app.scan().map(|m| {
                ok(format!(
                    "Scan {} complete: {} image(s), {} object(s)",
                    m.map_id.bold(),
                    m.image_count,
                    m.object_count
                ))
            })
        }
        Command::Plan => app.plan().map(|p| print_plan(&p)),
        Command::Pick => {
            println!("  Picking – press Ctrl-C to stop.");
            app.pick().map(|(plan, done)| {
                print_plan(&plan);
                ok(format!("{} of {} object(s) completed", done.len(), plan.visits.len()));
            })
        }
        Command::Move { target, feed_rate } => app.move_to(target, feed_rate).map(|p| ok(format!("At {p}"))),
        Command::Home => app.home().map(|p| ok(format!("Homed at {p}"))),
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        print_error(&e);
    }

    if let Some(dir) = app.last_archive()
        && archived_before.as_deref() != Some(dir)
    {
        println!("  Archived to {}", dir.display().to_string().dimmed());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn ok(msg: String) {
    println!("  {} {}", "✓".green().bold(), msg);
}

fn print_error(e: &SorterError) {
    match e {
        SorterError::Cancelled => println!("  {}", "Cancelled.".yellow()),
        SorterError::BoundaryViolation(reason) => {
            println!("  {} {}", "Rejected:".red().bold(), reason);
        }
        other => println!("  {} {}", "Error:".red().bold(), other),
    }
}

fn print_status(s: &crate::app::StatusReport) {
    let yes_no = |b: bool| if b { "yes".green() } else { "no".yellow() };
    println!();
    println!("{}", "Status".bold().underline());
    println!("  Controller   : {} (connected: {})", s.controller.bold(), yes_no(s.connected));
    match s.display.position {
        Some(p) => println!("  Position     : {p}"),
        None => println!("  Position     : {}", "unknown".dimmed()),
    }
    println!(
        "  Session      : {}{}",
        s.session.to_string().bold(),
        s.map_id
            .as_ref()
            .map(|id| format!(" ({id}, {} capture(s))", s.captures))
            .unwrap_or_default()
    );
    println!("  Detected     : {} object(s), {} pending", s.display.objects_detected, s.pending_objects);
    if let Some(done) = &s.display.last_completed {
        println!(
            "  Last map     : {} – {} image(s), {} object(s)",
            done.map_id, done.image_count, done.object_count
        );
    }
    if let Some(reason) = &s.display.last_abort {
        println!("  Last abort   : {}", reason.yellow());
    }
    println!(
        "  Validation   : {} checked, {} rejected ({:.1}%)",
        s.stats.validations_performed,
        s.stats.violations_detected,
        s.stats.violation_rate * 100.0
    );
    if let Some(v) = &s.display.last_violation {
        println!("  Last reject  : {}", v.to_string().red());
    }
    println!("  Events       : {} seen, {} object(s) saved", s.events_seen, s.objects_saved);
    if let Some(visits) = s.auto_plan_visits {
        println!("  Auto plan    : {visits} visit(s)");
    }
    println!();
}

fn print_plan(plan: &PickPlan) {
    println!();
    println!("{}", "Visit order".bold().underline());
    if plan.visits.is_empty() {
        println!("  {}", "nothing to visit".dimmed());
    }
    for (i, visit) in plan.visits.iter().enumerate() {
        if let Some(change) = &visit.tool_change {
            println!("       {} {} at {}", "tool".cyan(), change.tool_id, change.location);
        }
        match &visit.place {
            Some(place) => println!(
                "  {:>3}. {} at {} → {}",
                i + 1,
                visit.object_id,
                visit.target,
                place.bin_id
            ),
            None => println!("  {:>3}. {} at {}", i + 1, visit.object_id, visit.target),
        }
    }
    for ex in &plan.excluded {
        println!("  {} {} – {}", "skip".yellow(), ex.object_id, ex.reason);
    }
    println!();
}

fn print_help() {
    println!();
    println!("{}", "CNCSort Commands".bold().underline());
    println!("  {}          – connect to the configured controller", "/connect".bold().cyan());
    println!("  {}           – machine, session and store summary", "/status".bold().cyan());
    println!("  {}            – open a bed-mapping session", "/start".bold().cyan());
    println!("  {}          – capture at the current position", "/capture".bold().cyan());
    println!("  {}           – stitch the session into a bed map", "/finish".bold().cyan());
    println!("  {}   – abort the open session", "/abort [reason]".bold().cyan());
    println!("  {}             – grid scan over the workspace", "/scan".bold().cyan());
    println!("  {}             – show the visit order for pending objects", "/plan".bold().cyan());
    println!("  {}             – plan and visit every pending object", "/pick".bold().cyan());
    println!("  {}  – rapid move, or linear at feed f", "/move x y z [f]".bold().cyan());
    println!("  {}             – safe height, then the origin corner", "/home".bold().cyan());
    println!("  {}     – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
    println!("  Ctrl-C stops a running scan, pick or move.");
    println!();
}
