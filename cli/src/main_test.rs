use clap::CommandFactory;
use neffos::AuthPolicy;

use super::*;

#[test]
fn cli_definition_is_valid() {
    Cli::command().debug_assert();
}

#[test]
fn serve_defaults() {
    let cli = Cli::try_parse_from(["neffos", "serve"]).expect("parse");
    let Command::Serve(args) = cli.command else {
        panic!("expected serve");
    };
    assert_eq!(args.path, "/echo");
    assert_eq!(args.namespace, DEFAULT_NAMESPACE);
}

#[test]
fn token_and_secret_conflict() {
    let parsed = Cli::try_parse_from(["neffos", "serve", "--token", "abc", "--secret", "s"]);
    assert!(parsed.is_err());
}

#[test]
fn dial_url_appends_token() {
    let url = dial_url("ws://localhost:8080/echo", Some("abc")).expect("url");
    assert_eq!(url, "ws://localhost:8080/echo?token=abc");

    let url = dial_url("ws://localhost:8080/echo", None).expect("url");
    assert_eq!(url, "ws://localhost:8080/echo");

    assert!(dial_url("::nope", None).is_err());
}

#[test]
fn minted_token_passes_jwt_policy() {
    let token = mint_token("My Secret", Some("kataras")).expect("mint");
    let identity = JwtPolicy::hs256(b"My Secret").authenticate(&token).expect("valid");
    assert_eq!(identity.subject.as_deref(), Some("kataras"));

    assert!(JwtPolicy::hs256(b"other").authenticate(&token).is_err());
}
