pub mod limits;
pub mod logging;
pub mod mail;
pub mod otp;
pub mod store;
pub mod submissions;

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_INSECURE_COOKIES: &str = "insecure-cookies";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("contactgate")
        .about("Contact form gated by email verification codes")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("CONTACTGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_INSECURE_COOKIES)
                .long(ARG_INSECURE_COOKIES)
                .help("Omit the Secure attribute on the session cookie (plain HTTP only)")
                .env("CONTACTGATE_INSECURE_COOKIES")
                .action(ArgAction::SetTrue),
        );

    let command = store::with_args(command);
    let command = otp::with_args(command);
    let command = limits::with_args(command);
    let command = mail::with_args(command);
    let command = submissions::with_args(command);
    logging::with_args(command)
}
