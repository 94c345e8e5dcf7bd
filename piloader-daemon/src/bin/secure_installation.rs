// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Secure an installation of piloader.
//!
//! Interactive helper that reviews and rewrites the XML-RPC access
//! configuration and its ACL file.
//!
//! Exit codes:
//!     1: Runtime error
//!     2: Program did no changes on files
//!     4: No root permissions
//!     8: Write error to acl files

use clap::Parser;
use ini::Ini;
use piloader_core::IpAclManager;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_RUNTIME: u8 = 1;
const EXIT_NO_CHANGES: u8 = 2;
const EXIT_NO_ROOT: u8 = 4;
const EXIT_ACL_WRITE: u8 = 8;

/// ACL granting full control to all private IPv4 networks.
const PRIVATE_NETWORKS_ACL: &str = "127.*.*.*,4 \
    169.254.*.*,4 \
    10.*.*.*,4 \
    172.16.*.*,4 172.17.*.*,4 172.18.*.*,4 172.19.*.*,4 \
    172.20.*.*,4 172.21.*.*,4 172.22.*.*,4 172.23.*.*,4 \
    172.24.*.*,4 172.25.*.*,4 172.26.*.*,4 172.27.*.*,4 \
    172.28.*.*,4 172.29.*.*,4 172.30.*.*,4 172.31.*.*,4 \
    192.168.*.*,4";

/// Secure your installation of piloader
#[derive(Parser, Debug)]
#[command(name = "piloader-secure")]
#[command(version)]
struct Args {
    /// Daemon configuration file to harden
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "/etc/revpipyload/revpipyload.conf"
    )]
    conffile: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn run(args: &Args) -> Result<u8, String> {
    let mut conf = Ini::load_from_file(&args.conffile)
        .map_err(|e| format!("Can not access {}: {}", args.conffile.display(), e))?;

    let aclfile = conf
        .section(Some("XMLRPC"))
        .and_then(|s| s.get("aclfile"))
        .map(ToString::to_string)
        .ok_or_else(|| "No XMLRPC aclfile configured".to_string())?;

    let mut acl = IpAclManager::new(0, 4).map_err(|e| e.to_string())?;
    acl.load_file(&aclfile)
        .map_err(|e| format!("Can not access {aclfile}: {e}"))?;

    let xmlrpc = conf
        .section(Some("XMLRPC"))
        .and_then(|s| s.get("xmlrpc"))
        .map(|v| v == "1")
        .unwrap_or(false);
    let bindip = conf
        .section(Some("XMLRPC"))
        .and_then(|s| s.get("bindip"))
        .unwrap_or("127.0.0.1")
        .to_string();
    let only_localhost = bindip.starts_with("127.") || bindip.is_empty();

    println!();
    println!("This will secure your installation of piloader.");
    println!();
    println!("We found the following configuration files:");
    println!("    Piloader:      {}", args.conffile.display());
    println!("    XML-RPC ACL:   {aclfile}");
    println!();
    println!(
        "Access with the control client is {}activated{}",
        if xmlrpc { "" } else { "NOT " },
        if !xmlrpc {
            ""
        } else if only_localhost {
            " from this computer only (localhost)."
        } else {
            " from ACL listed remote computers!"
        }
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    if !only_localhost && ask(&mut lines, "\nDo you want to check ACL listed computers? (y/N) ")? {
        print_acls(&acl, &aclfile);
    }

    if unsafe { libc::getuid() } != 0 {
        eprintln!("\nYou need root permissions to change values (sudo).");
        return Ok(EXIT_NO_ROOT);
    }

    if ask(
        &mut lines,
        "\nDo you want to allow connections from remote hosts? (y/N) ",
    )? {
        conf.with_section(Some("XMLRPC")).set("xmlrpc", "1");
        conf.with_section(Some("XMLRPC")).set("bindip", "*");

        if ask(
            &mut lines,
            "Reset the ACL file to allow all private networks? (y/N) ",
        )? {
            if !store_acl(&mut acl, PRIVATE_NETWORKS_ACL) {
                return Ok(EXIT_ACL_WRITE);
            }
        } else if ask(
            &mut lines,
            "Reset the ACL file by enter individual ip addresses to grant access? (y/N) ",
        )? {
            let entries = collect_addresses(&mut lines)?;
            if !store_acl(&mut acl, &entries) {
                return Ok(EXIT_ACL_WRITE);
            }
        }
    } else if ask(
        &mut lines,
        "Do you want to allow connections from localhost ONLY? (y/N) ",
    )? {
        conf.with_section(Some("XMLRPC")).set("xmlrpc", "1");
        conf.with_section(Some("XMLRPC")).set("bindip", "127.0.0.1");

        if ask(
            &mut lines,
            "Reset the ACL file to allow localhost connections only? (y/N) ",
        )? && !store_acl(&mut acl, "127.*.*.*,4")
        {
            return Ok(EXIT_ACL_WRITE);
        }
    } else if ask(
        &mut lines,
        "\nWARNING: This will disable the possibility to connect with the \
         control client!\n         Are you sure? (y/N) ",
    )? {
        conf.with_section(Some("XMLRPC")).set("xmlrpc", "0");
        conf.with_section(Some("XMLRPC")).set("bindip", "127.0.0.1");
        if !store_acl(&mut acl, "") {
            return Ok(EXIT_ACL_WRITE);
        }
    } else {
        println!("\nWe did no changes!");
        return Ok(EXIT_NO_CHANGES);
    }

    conf.write_to_file(&args.conffile)
        .map_err(|e| format!("Can not write {}: {}", args.conffile.display(), e))?;

    print_acls(&acl, &aclfile);

    if ask(&mut lines, "\nDo you want to apply the new settings now? (Y/n) ")? {
        let _ = std::process::Command::new("/etc/init.d/revpipyload")
            .arg("reload")
            .status();
    } else {
        eprintln!(
            "\nYou have to activate the new settings for piloader!\n    \
             sudo /etc/init.d/revpipyload reload"
        );
    }

    Ok(0)
}

/// Ask a yes/no question; EOF counts as no.
fn ask(
    lines: &mut std::io::Lines<std::io::StdinLock<'_>>,
    prompt: &str,
) -> Result<bool, String> {
    print!("{prompt}");
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    match lines.next() {
        Some(Ok(line)) => {
            let answer = line.trim().to_ascii_lowercase();
            // Default of "(Y/n)" prompts is yes
            if prompt.contains("(Y/n)") {
                Ok(answer.is_empty() || answer == "y")
            } else {
                Ok(answer == "y")
            }
        }
        Some(Err(e)) => Err(e.to_string()),
        None => Ok(false),
    }
}

fn collect_addresses(
    lines: &mut std::io::Lines<std::io::StdinLock<'_>>,
) -> Result<String, String> {
    let pattern = address_pattern();
    let mut entries: Vec<String> = Vec::new();
    loop {
        print!("Enter single IPv4 address | Press RETURN to complete: ");
        std::io::stdout().flush().map_err(|e| e.to_string())?;
        match lines.next() {
            Some(Ok(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    return Ok(entries.join(" "));
                }
                if pattern.is_match(line) {
                    entries.push(format!("{line},4"));
                } else {
                    eprintln!("Wrong format (0.0.0.0)");
                }
            }
            _ => return Ok(entries.join(" ")),
        }
    }
}

fn address_pattern() -> regex::Regex {
    regex::Regex::new(r"^([\d*]{1,3}\.){3}[\d*]{1,3}$").expect("static regex")
}

fn store_acl(acl: &mut IpAclManager, entries: &str) -> bool {
    if acl.load(entries).is_err() {
        eprintln!("Error while parsing ACL entries!");
        return false;
    }
    if acl.write_file(None, Some("XML-RPC")).is_err() {
        eprintln!("Error while writing ACL file!");
        return false;
    }
    true
}

fn print_acls(acl: &IpAclManager, aclfile: &str) {
    if acl.is_empty() {
        eprintln!(
            "\nWARNING: NO IP addresses defined in ACL!\n         You will \
             not be able to connect with the control client at this moment!"
        );
        return;
    }
    println!("\nThis is the actual ACL file ({aclfile}):");
    for (counter, (ip, level)) in acl.iter().enumerate() {
        if counter % 2 == 0 {
            println!();
        } else {
            print!("     |     ");
        }
        print!("{ip:15} - Level: {level:2}");
    }
    println!();
}
