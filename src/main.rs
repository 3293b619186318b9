use babel_chat::{
    Archive, ChatSession, Composition, ConversationEntry, DEFAULT_CONFIG_PATH,
    GoogleTranslateProvider, InMemoryStore, JsonFileArchive, LanguagePreferences, LocalEventHub,
    MachineTranslator, MemoryArchive, MockMode, MockTranslator, Participants, SessionServices,
    TranslationGateway, UserId, load_config,
};
use clap::{Arg, Command};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("babel-chat")
        .version("0.1.0")
        .about("Send a translated chat message through the conversation engine")
        .arg(
            Arg::new("message")
                .help("Message text to send")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .short('f')
                .help("Language the message is written in (default: es)")
                .default_value("es"),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .short('t')
                .help("Language of the recipient (default: en)")
                .default_value("en"),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .short('m')
                .help("Use mock translators instead of Google Translate")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Engine config file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("archive-dir")
                .long("archive-dir")
                .help("Directory for the conversation archive (default: in memory)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Log every pipeline step")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let text = matches
        .get_one::<String>("message")
        .ok_or("message is required")?;
    let from = matches.get_one::<String>("from").ok_or("missing --from")?;
    let to = matches.get_one::<String>("to").ok_or("missing --to")?;
    let config_path = matches
        .get_one::<String>("config")
        .ok_or("missing --config")?;

    let mut config = load_config(config_path);
    if let Some(dir) = matches.get_one::<String>("archive-dir") {
        config.archive_dir = Some(PathBuf::from(dir));
    }

    let (primary, secondary): (Arc<dyn MachineTranslator>, Arc<dyn MachineTranslator>) =
        if matches.get_flag("mock") {
            // The primary echoes its input, so every send exercises the retry path.
            (
                Arc::new(MockTranslator::new(MockMode::NoOp).named("mock-primary")),
                Arc::new(MockTranslator::new(MockMode::Suffix).named("mock-secondary")),
            )
        } else {
            if env::var("GOOGLE_TRANSLATE_API_KEY").is_err() {
                eprintln!("❌ GOOGLE_TRANSLATE_API_KEY environment variable not set");
                eprintln!("   Set it with: export GOOGLE_TRANSLATE_API_KEY=your_api_key");
                eprintln!("   Or use --mock to use mock translators");
                return Err("Missing API key".into());
            }
            (
                Arc::new(GoogleTranslateProvider::from_env()?.with_model("nmt")),
                Arc::new(GoogleTranslateProvider::from_env()?.with_model("base")),
            )
        };

    let archive: Arc<dyn Archive> = match &config.archive_dir {
        Some(dir) => Arc::new(JsonFileArchive::new(dir)),
        None => Arc::new(MemoryArchive::new()),
    };
    let services = SessionServices {
        gateway: TranslationGateway::new(primary, secondary),
        store: Arc::new(InMemoryStore::new()),
        archive,
        events: Arc::new(LocalEventHub::default()),
        audio: None,
        push: None,
    };
    let participants = Participants::new(UserId::from("me"), UserId::from("them"))
        .ok_or("participants must differ")?;
    let languages = LanguagePreferences {
        local: from.clone(),
        remote: to.clone(),
    };

    let mut session = ChatSession::open(services, participants, None, languages, &config).await?;
    let message = session.send(Composition::text(text.as_str())).await?;
    println!("✅ Sent {}", message.identifier);

    if message.translation.is_untranslated() {
        println!("🔁 Came back untranslated, retrying");
        match session.retry(&message.identifier).await {
            Ok(translation) => println!("✅ Retry produced \"{}\"", translation.output),
            Err(err) => eprintln!("❌ Retry failed: {err}"),
        }
    }

    println!();
    for entry in session.entries() {
        match entry {
            ConversationEntry::Confirmed(message) => println!(
                "[{}] {}: \"{}\" → \"{}\" ({})",
                message.sent_date.format("%H:%M:%S"),
                message.from_user,
                message.translation.input,
                message.translation.output,
                message.translation.language_pair,
            ),
            ConversationEntry::Pending(pending) => println!(
                "[{}] {}: \"{}\" (sending)",
                pending.sent_date.format("%H:%M:%S"),
                pending.from_user,
                pending.translation.input,
            ),
        }
    }

    session.close().await;
    Ok(())
}
