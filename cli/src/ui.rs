//! UI utilities for pretty printing

use bftkv_core::client::KeyValue;
use bftkv_core::protocol::{Message, MessageHeader};
use colored::Colorize;

pub fn print_banner() {
    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", format!("  {}", bftkv_core::version_string()).bright_cyan().bold());
    println!("{}", "  Byzantine-tolerant replicated CRDT store".bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
}

pub fn print_help() {
    println!();
    println!("{}", "Available Commands:".bright_cyan().bold());
    println!();
    println!("  {:<30} {}", "help".bright_green(), "Show this help message");
    println!("  {:<30} {}", "quit, exit".bright_green(), "Exit the shell");
    println!();
    println!("  {}", "Keys:".bright_yellow().bold());
    println!("  {:<30} {}", "new <counter|gset|2pset>".bright_green(), "Create a key and make it current");
    println!("  {:<30} {}", "use <key>".bright_green(), "Switch the current key");
    println!("  {:<30} {}", "get [key]".bright_green(), "Show a key's value");
    println!();
    println!("  {}", "Updates:".bright_yellow().bold());
    println!("  {:<30} {}", "inc [key] <n>".bright_green(), "Increment a counter");
    println!("  {:<30} {}", "dec [key] <n>".bright_green(), "Decrement a counter");
    println!("  {:<30} {}", "add [key] <json>".bright_green(), "Add an element to a set");
    println!("  {:<30} {}", "rmv [key] <json>".bright_green(), "Remove an element from a 2pset");
    println!();
    println!("  {}", "Network:".bright_yellow().bold());
    println!("  {:<30} {}", "ping".bright_green(), "Check the node is alive");
    println!("  {:<30} {}", "connect <host> <port>".bright_green(), "Link the node to a peer");
    println!("  {:<30} {}", "raw <TAG> [body]".bright_green(), "Send a raw frame");
    println!();
    println!("  {}", "Info:".bright_yellow().bold());
    println!("  {:<30} {}", "context".bright_green(), "Show node and current key");
    println!("  {:<30} {}", "version".bright_green(), "Show version information");
    println!();
}

pub fn print_value(value: &KeyValue) {
    println!("{} {}", "Key:".bright_green(), value.key);
    println!("{} {}", "Type:".bright_green(), value.crdt_type);
    println!("{} {}", "Value:".bright_green(), value.value.to_string().bright_white().bold());
}

pub fn print_reply(reply: &Message) {
    let tag = reply.header.to_string();
    let tag = match reply.header {
        MessageHeader::Ok | MessageHeader::Pong => tag.bright_green(),
        MessageHeader::No => tag.yellow(),
        MessageHeader::Err => tag.bright_red(),
        _ => tag.bright_blue(),
    };
    if reply.body.is_empty() {
        println!("{}", tag);
    } else {
        println!("{} {}", tag, reply.body_str());
    }
}

pub fn print_error(msg: &str) {
    println!("{} {}", "✗".bright_red(), msg.red());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".bright_green(), msg.bright_green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".bright_blue(), msg);
}
