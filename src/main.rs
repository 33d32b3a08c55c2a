mod config;
mod quiz;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use config::Config;
use dotenv::dotenv;
use log::{debug, warn};
use quiz::{
    api::{HttpQuizApi, QuizApi},
    chain::{format_units, RelayWallet},
    leaderboard::{Leaderboard, SortOrder},
    lifecycle::{DraftField, DraftLimits, LifecycleState, QuizDraft, QuizLifecycle, StopReport},
    session::{self, ParticipantSession, QuestionAction, Step, SubmissionState, Tick},
    settlement::SettlementCoordinator,
    timer::Repeating,
    Answer, Question, QuizError, WalletAddress,
};
use teloxide::{
    dispatching::{
        dialogue::{serializer::Json, ErasedStorage, SqliteStorage, Storage},
        UpdateHandler,
    },
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup, KeyboardRemove},
};
use tokio::sync::Mutex;

type QuizDialogue = Dialogue<State, ErasedStorage<State>>;
type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Default, serde::Serialize, serde::Deserialize)]
pub enum State {
    #[default]
    Start,
    ReceiveMenuChoice {
        wallet: Option<WalletAddress>,
    },
    ReceiveWalletAddress,
    Drafting {
        wallet: WalletAddress,
        draft: QuizDraft,
    },
    Hosting {
        wallet: WalletAddress,
        quiz_id: String,
    },
    ReceiveQuizCode {
        wallet: WalletAddress,
    },
    ReceiveParticipantName {
        wallet: WalletAddress,
        quiz_id: String,
    },
    Answering {
        wallet: WalletAddress,
        quiz_id: String,
    },
    ReceiveLeaderboardCode {
        wallet: Option<WalletAddress>,
    },
    BrowsingLeaderboard {
        wallet: Option<WalletAddress>,
        quiz_id: String,
        filter: String,
        order: SortOrder,
    },
}

impl State {
    fn wallet(&self) -> Option<WalletAddress> {
        match self {
            State::Start | State::ReceiveWalletAddress => None,
            State::ReceiveMenuChoice { wallet } | State::ReceiveLeaderboardCode { wallet } => wallet.clone(),
            State::BrowsingLeaderboard { wallet, .. } => wallet.clone(),
            State::Drafting { wallet, .. }
            | State::Hosting { wallet, .. }
            | State::ReceiveQuizCode { wallet }
            | State::ReceiveParticipantName { wallet, .. }
            | State::Answering { wallet, .. } => Some(wallet.clone()),
        }
    }
}

/// Creator view of one quiz. Dropping it stops the participant polling.
struct HostPanel {
    lifecycle: QuizLifecycle,
    poller: Repeating,
}

/// Participant view of one quiz. Dropping it cancels the countdown.
struct LiveSession {
    session: ParticipantSession,
    countdown: Repeating,
}

struct App {
    config: Config,
    http: reqwest::Client,
    api: HttpQuizApi,
    settlement: SettlementCoordinator,
    hosts: Mutex<HashMap<ChatId, Arc<Mutex<HostPanel>>>>,
    sessions: Mutex<HashMap<ChatId, Arc<Mutex<LiveSession>>>>,
}

impl App {
    fn new(config: Config, http: reqwest::Client) -> Self {
        let api = HttpQuizApi::new(http.clone(), config.quiz_api_url.clone());
        Self {
            config,
            http,
            api,
            settlement: SettlementCoordinator::new(),
            hosts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn wallet(&self, address: Option<WalletAddress>) -> RelayWallet {
        RelayWallet::new(
            self.http.clone(),
            self.config.signer_relay_url.clone(),
            self.config.escrow_contract.clone(),
            address,
        )
    }

    async fn session(&self, chat_id: ChatId) -> Option<Arc<Mutex<LiveSession>>> {
        self.sessions.lock().await.get(&chat_id).cloned()
    }

    async fn host(&self, chat_id: ChatId) -> Option<Arc<Mutex<HostPanel>>> {
        self.hosts.lock().await.get(&chat_id).cloned()
    }

    /// Forgets whatever the chat was doing. Work already handed off (a
    /// submission in flight, a broadcast transaction) runs to completion.
    async fn leave(&self, chat_id: ChatId) {
        self.sessions.lock().await.remove(&chat_id);
        self.hosts.lock().await.remove(&chat_id);
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    pretty_env_logger::init();
    log::info!("Starting quiz escrow bot...");

    let config = Config::from_env().expect("Invalid configuration");
    let bot = Bot::from_env();

    println!("Establishing connection to the database...");
    let storage: Arc<ErasedStorage<State>> = SqliteStorage::open(&config.dialogue_db, Json)
        .await
        .expect("Failed to open the dialogue database")
        .erase();
    println!("Connection established");

    // relay calls block until the transaction is mined
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .expect("Failed to build the HTTP client");
    let app = Arc::new(App::new(config, http));

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![storage, app])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    let messages = Update::filter_message()
        .enter_dialogue::<Message, ErasedStorage<State>, State>()
        .branch(dptree::filter(|msg: Message| msg.text() == Some(CANCEL_COMMAND)).endpoint(cancel))
        .branch(dptree::case![State::Start].endpoint(start))
        .branch(dptree::case![State::ReceiveMenuChoice { wallet }].endpoint(receive_menu_choice))
        .branch(dptree::case![State::ReceiveWalletAddress].endpoint(receive_wallet_address))
        .branch(dptree::case![State::Drafting { wallet, draft }].endpoint(drafting))
        .branch(dptree::case![State::Hosting { wallet, quiz_id }].endpoint(hosting))
        .branch(dptree::case![State::ReceiveQuizCode { wallet }].endpoint(receive_quiz_code))
        .branch(
            dptree::case![State::ReceiveParticipantName { wallet, quiz_id }]
                .endpoint(receive_participant_name),
        )
        .branch(dptree::case![State::Answering { wallet, quiz_id }].endpoint(answering))
        .branch(dptree::case![State::ReceiveLeaderboardCode { wallet }].endpoint(receive_leaderboard_code))
        .branch(
            dptree::case![State::BrowsingLeaderboard {
                wallet,
                quiz_id,
                filter,
                order
            }]
            .endpoint(browsing_leaderboard),
        );

    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(question_callback))
        .branch(messages)
}

const CANCEL_COMMAND: &str = "/cancel";

const CONNECT_WALLET: &str = "Connect wallet";
const CREATE_QUIZ: &str = "Create quiz";
const JOIN_QUIZ: &str = "Join quiz";
const LEADERBOARD: &str = "Leaderboard";
const MENU: &str = "Menu";

const START_QUIZ: &str = "Start quiz";
const STOP_QUIZ: &str = "Stop quiz";
const RETRY_CHAIN: &str = "Retry on-chain step";
const PARTICIPANTS: &str = "Participants";

const NEXT_QUESTION: &str = "Next question";
const SUBMIT_QUIZ: &str = "Submit quiz";
const RETRY_SUBMISSION: &str = "Retry submission";

const SORT_BY_NAME: &str = "Sort by name";
const SORT_BY_SCORE: &str = "Sort by score";
const CLEAR_FILTER: &str = "Clear filter";

const COUNTDOWN_WARNING_SECONDS: u32 = 10;

const GREETING_TEXT: &str = "Hi! I host timed quizzes with on-chain rewards. \
Connect your wallet, then create a quiz or join one with its code.";

fn menu_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(CONNECT_WALLET)],
        vec![KeyboardButton::new(CREATE_QUIZ), KeyboardButton::new(JOIN_QUIZ)],
        vec![KeyboardButton::new(LEADERBOARD)],
    ])
}

fn host_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(START_QUIZ), KeyboardButton::new(STOP_QUIZ)],
        vec![KeyboardButton::new(PARTICIPANTS), KeyboardButton::new(RETRY_CHAIN)],
        vec![KeyboardButton::new(MENU)],
    ])
}

/// Buttons carry the index of the question they were sent with.
fn question_keyboard(question: &Question, index: usize, is_last: bool) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = question
        .options
        .iter()
        .map(|o| {
            let action = QuestionAction::Choose {
                index,
                key: o.key.clone(),
            };
            vec![InlineKeyboardButton::callback(o.text.clone(), action.encode())]
        })
        .collect();
    let advance = if is_last { SUBMIT_QUIZ } else { NEXT_QUESTION };
    rows.push(vec![InlineKeyboardButton::callback(
        advance,
        QuestionAction::Next { index }.encode(),
    )]);
    InlineKeyboardMarkup::new(rows)
}

fn answering_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![KeyboardButton::new(MENU)]])
}

fn finished_keyboard(can_retry: bool) -> KeyboardMarkup {
    let mut row = Vec::new();
    if can_retry {
        row.push(KeyboardButton::new(RETRY_SUBMISSION));
    }
    row.push(KeyboardButton::new(MENU));
    KeyboardMarkup::new(vec![row])
}

fn leaderboard_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(SORT_BY_NAME), KeyboardButton::new(SORT_BY_SCORE)],
        vec![KeyboardButton::new(CLEAR_FILTER), KeyboardButton::new(MENU)],
    ])
}

async fn start(bot: Bot, dialogue: QuizDialogue, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, GREETING_TEXT)
        .reply_markup(menu_keyboard())
        .await?;
    dialogue.update(State::ReceiveMenuChoice { wallet: None }).await?;
    Ok(())
}

async fn cancel(bot: Bot, dialogue: QuizDialogue, app: Arc<App>) -> HandlerResult {
    let wallet = dialogue.get().await?.and_then(|state| state.wallet());
    go_to_menu(&bot, &dialogue, &app, wallet).await
}

async fn go_to_menu(bot: &Bot, dialogue: &QuizDialogue, app: &App, wallet: Option<WalletAddress>) -> HandlerResult {
    let chat_id = dialogue.chat_id();
    app.leave(chat_id).await;
    bot.send_message(chat_id, "What would you like to do?")
        .reply_markup(menu_keyboard())
        .await?;
    dialogue.update(State::ReceiveMenuChoice { wallet }).await?;
    Ok(())
}

async fn receive_menu_choice(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    wallet: Option<WalletAddress>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    match (msg.text(), wallet) {
        (Some(CONNECT_WALLET), _) => {
            bot.send_message(chat_id, "Send me your wallet address (0x...)")
                .reply_markup(KeyboardRemove::new())
                .await?;
            dialogue.update(State::ReceiveWalletAddress).await?;
        }
        (Some(CREATE_QUIZ), Some(wallet)) => {
            let draft = QuizDraft::default();
            bot.send_message(chat_id, field_prompt(DraftField::CreatorName, None))
                .reply_markup(KeyboardRemove::new())
                .await?;
            dialogue.update(State::Drafting { wallet, draft }).await?;
        }
        (Some(JOIN_QUIZ), Some(wallet)) => {
            bot.send_message(chat_id, "Enter the quiz code")
                .reply_markup(KeyboardRemove::new())
                .await?;
            dialogue.update(State::ReceiveQuizCode { wallet }).await?;
        }
        (Some(CREATE_QUIZ), None) | (Some(JOIN_QUIZ), None) => {
            bot.send_message(chat_id, QuizError::UnauthorizedWallet.to_string())
                .reply_markup(menu_keyboard())
                .await?;
        }
        (Some(LEADERBOARD), wallet) => {
            bot.send_message(chat_id, "Enter the quiz code")
                .reply_markup(KeyboardRemove::new())
                .await?;
            dialogue.update(State::ReceiveLeaderboardCode { wallet }).await?;
        }
        _ => {
            bot.send_message(chat_id, "Please choose one of the options")
                .reply_markup(menu_keyboard())
                .await?;
        }
    }
    Ok(())
}

async fn receive_wallet_address(bot: Bot, dialogue: QuizDialogue, msg: Message) -> HandlerResult {
    let parsed = msg.text().map(str::parse::<WalletAddress>);
    match parsed {
        Some(Ok(wallet)) => {
            bot.send_message(msg.chat.id, format!("Wallet {} connected.", wallet))
                .reply_markup(menu_keyboard())
                .await?;
            dialogue
                .update(State::ReceiveMenuChoice {
                    wallet: Some(wallet),
                })
                .await?;
        }
        Some(Err(err)) => {
            bot.send_message(msg.chat.id, err.to_string()).await?;
        }
        None => {
            bot.send_message(msg.chat.id, "Please send the address as text")
                .await?;
        }
    }
    Ok(())
}

fn field_prompt(field: DraftField, limits: Option<&DraftLimits>) -> String {
    match field {
        DraftField::CreatorName => "Let's create a quiz! What is your name?".to_string(),
        DraftField::Prompt => "What should the quiz be about?".to_string(),
        DraftField::Participants => "How many participants do you expect?".to_string(),
        DraftField::QuestionCount => format!(
            "How many questions? (1-{})",
            limits.map_or(quiz::lifecycle::MAX_QUESTIONS, |l| l.max_questions)
        ),
        DraftField::RewardPerScore => "Reward per correct answer, in ETH (e.g. 0.001)".to_string(),
    }
}

async fn drafting(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    (wallet, mut draft): (WalletAddress, QuizDraft),
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let limits = app.config.draft_limits();
    let Some(text) = msg.text() else {
        bot.send_message(chat_id, "Please answer with text").await?;
        return Ok(());
    };

    if let Some(field) = draft.next_field() {
        if let Err(err) = draft.fill(field, text, &limits) {
            bot.send_message(chat_id, format!("{}\n\n{}", err, field_prompt(field, Some(&limits))))
                .await?;
            return Ok(());
        }
    }
    if let Some(next) = draft.next_field() {
        bot.send_message(chat_id, field_prompt(next, Some(&limits)))
            .await?;
        dialogue.update(State::Drafting { wallet, draft }).await?;
        return Ok(());
    }

    let plan = match draft.validate(&limits) {
        Ok(plan) => plan,
        Err(err) => {
            bot.send_message(chat_id, err.to_string()).await?;
            return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
        }
    };

    bot.send_message(
        chat_id,
        format!(
            "Creating the quiz and depositing {} ETH into escrow...",
            format_units(plan.total_cost, limits.reward_decimals)
        ),
    )
    .await?;

    let signer = app.wallet(Some(wallet.clone()));
    let mut lifecycle = match QuizLifecycle::create(&app.api, &signer, plan).await {
        Ok(lifecycle) => lifecycle,
        Err(err) => {
            bot.send_message(chat_id, format!("An error occurred while creating the quiz: {}", err))
                .await?;
            return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
        }
    };
    let quiz_id = lifecycle.quiz_id().to_string();
    let reply = match lifecycle.fund(&app.settlement, &signer).await {
        Ok(receipt) => format!(
            "Quiz successfully created!\nShare this code with participants: {}\nEscrow funded in {}",
            quiz_id, receipt.tx_hash
        ),
        Err(err) => format!(
            "Quiz {} was created but funding the escrow failed: {}\nUse \"{}\" to try again.",
            quiz_id, err, RETRY_CHAIN
        ),
    };

    open_host_panel(&app, &bot, chat_id, lifecycle).await;
    bot.send_message(chat_id, reply)
        .reply_markup(host_keyboard())
        .await?;
    dialogue.update(State::Hosting { wallet, quiz_id }).await?;
    Ok(())
}

async fn open_host_panel(app: &Arc<App>, bot: &Bot, chat_id: ChatId, lifecycle: QuizLifecycle) -> Arc<Mutex<HostPanel>> {
    let mut poller = Repeating::new();
    if lifecycle.state() != LifecycleState::Closed {
        watch_participants(&mut poller, app, bot, chat_id, lifecycle.quiz_id().to_string());
    }
    let panel = Arc::new(Mutex::new(HostPanel { lifecycle, poller }));
    app.hosts.lock().await.insert(chat_id, panel.clone());
    panel
}

/// Reports to the creator whenever the number of joined participants changes.
fn watch_participants(poller: &mut Repeating, app: &Arc<App>, bot: &Bot, chat_id: ChatId, quiz_id: String) {
    let period = app.config.participant_poll;
    let app = app.clone();
    let bot = bot.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    poller.start(period, move || {
        let (app, bot, quiz_id, seen) = (app.clone(), bot.clone(), quiz_id.clone(), seen.clone());
        async move {
            match app.api.leaderboard(&quiz_id).await {
                Ok(data) => {
                    let count = data.participants.len();
                    if seen.swap(count, Ordering::Relaxed) != count {
                        let names = data
                            .participants
                            .iter()
                            .map(|p| p.participant_name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ");
                        if let Err(err) = bot
                            .send_message(chat_id, format!("Participants ({}): {}", count, names))
                            .await
                        {
                            warn!("Failed to report participants to {}: {}", chat_id, err);
                        }
                    }
                }
                Err(err) => debug!("Polling participants of {} failed: {}", quiz_id, err),
            }
            ControlFlow::Continue(())
        }
    });
}

fn retry_hint(err: &QuizError) -> &'static str {
    if err.is_retriable() {
        "\nPlease try again."
    } else {
        ""
    }
}

fn describe_stop(report: &StopReport) -> String {
    let mut lines = Vec::new();
    match &report.api {
        Ok(()) => lines.push("Quiz has ended.".to_string()),
        Err(err) => lines.push(format!("Failed to update the quiz status: {}", err)),
    }
    match &report.chain {
        Ok(receipt) => lines.push(format!("Escrow closed in transaction {}", receipt.tx_hash)),
        Err(err) => lines.push(format!(
            "Closing the escrow failed: {}\nUse \"{}\" to try again.",
            err, RETRY_CHAIN
        )),
    }
    lines.join("\n")
}

async fn hosting(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    (wallet, quiz_id): (WalletAddress, String),
) -> HandlerResult {
    let chat_id = msg.chat.id;
    if msg.text() == Some(MENU) {
        return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
    }

    let signer = app.wallet(Some(wallet.clone()));
    let panel = match app.host(chat_id).await {
        Some(panel) => panel,
        None => match QuizLifecycle::resume(&app.api, &app.settlement, &signer, &quiz_id).await {
            Ok(lifecycle) => open_host_panel(&app, &bot, chat_id, lifecycle).await,
            Err(err) => {
                bot.send_message(chat_id, format!("Cannot manage quiz {}: {}", quiz_id, err))
                    .await?;
                return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
            }
        },
    };
    let mut panel = panel.lock().await;

    let reply = match msg.text() {
        Some(START_QUIZ) => match panel.lifecycle.start(&app.api, &signer).await {
            Ok(()) => format!("Quiz has started! Participants can join with code {}", quiz_id),
            Err(err) => format!("Failed to start the quiz: {}{}", err, retry_hint(&err)),
        },
        Some(STOP_QUIZ) => {
            let stopped = panel.lifecycle.stop(&app.api, &app.settlement, &signer).await;
            match stopped {
                Ok(report) => {
                    panel.poller.stop();
                    describe_stop(&report)
                }
                Err(err) => format!("Cannot stop the quiz: {}", err),
            }
        }
        Some(RETRY_CHAIN) if !panel.lifecycle.is_funded() => {
            match panel.lifecycle.fund(&app.settlement, &signer).await {
                Ok(receipt) => format!("Escrow funded in {}", receipt.tx_hash),
                Err(err) => format!("Funding the escrow failed: {}", err),
            }
        }
        Some(RETRY_CHAIN) if panel.lifecycle.needs_chain_retry() => {
            match panel.lifecycle.retry_close(&app.api, &app.settlement, &signer).await {
                Ok(report) => describe_stop(&report),
                Err(err) => format!("Cannot retry: {}", err),
            }
        }
        Some(RETRY_CHAIN) => "There is nothing to retry.".to_string(),
        Some(PARTICIPANTS) => match app.api.leaderboard(&quiz_id).await {
            Ok(data) => {
                let board = Leaderboard::from(data);
                render_leaderboard(&board, &quiz_id, "", SortOrder::Score)
            }
            Err(err) => format!("Failed to fetch participants: {}", err),
        },
        _ => "Please use the buttons below.".to_string(),
    };

    bot.send_message(chat_id, reply)
        .reply_markup(host_keyboard())
        .await?;
    Ok(())
}

async fn receive_quiz_code(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    wallet: WalletAddress,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let code = match msg.text().map(str::trim) {
        Some(MENU) => return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await,
        Some(code) if !code.is_empty() => code.to_string(),
        _ => {
            bot.send_message(chat_id, "Please enter the quiz code").await?;
            return Ok(());
        }
    };

    let opened = session::open_session(&app.api, &code, &wallet, app.config.question_seconds).await;
    match opened {
        Ok(participant) if !participant.quiz().is_open() => {
            bot.send_message(
                chat_id,
                "Quiz hasn't started yet. Please wait and send the code again to refresh.",
            )
            .await?;
        }
        Ok(participant) => {
            let quiz_id = participant.quiz().quiz_id.clone();
            let live = LiveSession {
                session: participant,
                countdown: Repeating::new(),
            };
            app.sessions
                .lock()
                .await
                .insert(chat_id, Arc::new(Mutex::new(live)));
            bot.send_message(chat_id, "Welcome to the quiz! Please enter your name to begin")
                .await?;
            dialogue
                .update(State::ReceiveParticipantName { wallet, quiz_id })
                .await?;
        }
        Err(err) => {
            bot.send_message(chat_id, format!("{}{}", err, retry_hint(&err)))
                .await?;
        }
    }
    Ok(())
}

async fn receive_participant_name(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    (wallet, quiz_id): (WalletAddress, String),
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let Some(name) = msg.text() else {
        bot.send_message(chat_id, "Please enter your name.").await?;
        return Ok(());
    };
    let Some(handle) = app.session(chat_id).await else {
        bot.send_message(chat_id, "This quiz session has expired.").await?;
        return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
    };
    let mut live = handle.lock().await;

    let joined = session::join_quiz(&app.api, &mut live.session, name).await;
    match joined {
        Ok(()) => {}
        Err(err @ QuizError::Validation(_)) => {
            bot.send_message(chat_id, err.to_string()).await?;
            return Ok(());
        }
        Err(err) => {
            drop(live);
            bot.send_message(chat_id, format!("Could not join the quiz: {}", err))
                .await?;
            return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
        }
    }
    bot.send_message(chat_id, "Joined quiz successfully!")
        .reply_markup(answering_keyboard())
        .await?;

    match live.session.begin() {
        Ok(Step::Question(index)) => {
            start_countdown(&app, &bot, chat_id, &handle, &mut live);
            send_question(&bot, chat_id, &live.session, index).await?;
        }
        Ok(Step::Finished) => {
            drop(live);
            tokio::spawn(finish_session(app.clone(), bot.clone(), chat_id, handle.clone()));
        }
        Err(err) => {
            bot.send_message(chat_id, err.to_string()).await?;
        }
    }
    dialogue.update(State::Answering { wallet, quiz_id }).await?;
    Ok(())
}

async fn send_question(
    bot: &Bot,
    chat_id: ChatId,
    participant: &ParticipantSession,
    index: usize,
) -> Result<(), teloxide::RequestError> {
    let quiz = participant.quiz();
    let Some(question) = quiz.questions.get(index) else {
        return Ok(());
    };
    let text = format!(
        "Question {} of {} ({}s)\n\n{}",
        index + 1,
        quiz.question_count(),
        participant.question_seconds(),
        question.text
    );
    bot.send_message(chat_id, text)
        .reply_markup(question_keyboard(question, index, index + 1 == quiz.question_count()))
        .await?;
    Ok(())
}

/// Replaces the session's countdown with a fresh one-second ticker.
fn start_countdown(app: &Arc<App>, bot: &Bot, chat_id: ChatId, handle: &Arc<Mutex<LiveSession>>, live: &mut LiveSession) {
    let weak = Arc::downgrade(handle);
    let app = app.clone();
    let bot = bot.clone();
    live.countdown.start(Duration::from_secs(1), move || {
        countdown_tick(app.clone(), bot.clone(), chat_id, weak.clone())
    });
}

async fn countdown_tick(app: Arc<App>, bot: Bot, chat_id: ChatId, weak: Weak<Mutex<LiveSession>>) -> ControlFlow<()> {
    let Some(handle) = weak.upgrade() else {
        return ControlFlow::Break(());
    };
    let mut live = handle.lock().await;

    match live.session.tick() {
        Tick::Idle => ControlFlow::Break(()),
        Tick::Remaining(left) => {
            if left == COUNTDOWN_WARNING_SECONDS {
                notify(&bot, chat_id, format!("{} seconds left", left)).await;
            }
            ControlFlow::Continue(())
        }
        Tick::TimedOut(Step::Question(index)) => {
            notify(&bot, chat_id, "Time's up! Moving on.".to_string()).await;
            if let Err(err) = send_question(&bot, chat_id, &live.session, index).await {
                warn!("Failed to send question {} to {}: {}", index + 1, chat_id, err);
            }
            ControlFlow::Continue(())
        }
        Tick::TimedOut(Step::Finished) => {
            drop(live);
            notify(&bot, chat_id, "Time's up! Submitting your answers...".to_string()).await;
            tokio::spawn(finish_session(app, bot, chat_id, handle));
            ControlFlow::Break(())
        }
    }
}

async fn notify(bot: &Bot, chat_id: ChatId, text: String) {
    if let Err(err) = bot.send_message(chat_id, text).await {
        warn!("Failed to notify {}: {}", chat_id, err);
    }
}

/// Scores the answers and claims the reward. Runs detached from the chat
/// so that leaving the quiz does not interrupt a broadcast transaction.
async fn finish_session(app: Arc<App>, bot: Bot, chat_id: ChatId, handle: Arc<Mutex<LiveSession>>) {
    let mut live = handle.lock().await;
    live.countdown.stop();

    let signer = app.wallet(Some(live.session.wallet().clone()));
    let result = session::submit(&app.api, &app.settlement, &signer, &mut live.session).await;
    let quiz_id = live.session.quiz().quiz_id.clone();
    let name = live.session.participant_name().to_string();
    let can_retry = live.session.submission().map_or(false, |s| s.can_retry());
    drop(live);

    let text = match result {
        Ok(SubmissionState::Settled { score, tx_hash }) => format!(
            "Your score: {}\nReward claimed in transaction {}",
            score, tx_hash
        ),
        Ok(SubmissionState::NothingToClaim { score }) => format!(
            "Your score: {}\nScore must be greater than 0 to claim a reward.",
            score
        ),
        Ok(other) => format!("Submission status: {:?}", other),
        Err(err) => format!("An error occurred while submitting the quiz: {}", err),
    };
    let text = format!("Thanks, {}!\n{}\n\nLeaderboard code: {}", name, text, quiz_id);

    if let Err(err) = bot
        .send_message(chat_id, text)
        .reply_markup(finished_keyboard(can_retry))
        .await
    {
        warn!("Failed to report submission to {}: {}", chat_id, err);
    }
}

async fn answering(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    (wallet, _quiz_id): (WalletAddress, String),
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let text = msg.text().unwrap_or_default();
    if text == MENU {
        return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
    }
    let Some(handle) = app.session(chat_id).await else {
        bot.send_message(chat_id, "This quiz session has expired.").await?;
        return go_to_menu(&bot, &dialogue, &app, Some(wallet)).await;
    };
    let live = handle.lock().await;

    if let Some(retryable) = live.session.submission().map(SubmissionState::can_retry) {
        let reply = if text == RETRY_SUBMISSION && retryable {
            drop(live);
            tokio::spawn(finish_session(app.clone(), bot.clone(), chat_id, handle.clone()));
            "Retrying..."
        } else if retryable {
            "Your answers were not submitted yet."
        } else {
            "You have finished this quiz."
        };
        bot.send_message(chat_id, reply).await?;
        return Ok(());
    }

    bot.send_message(chat_id, "Use the buttons under the question.")
        .await?;
    Ok(())
}

fn selected_text(participant: &ParticipantSession) -> Option<String> {
    let question = participant.current_question()?;
    match participant.current_answer()? {
        Answer::Selected(key) => question.option(key).map(|o| o.text.clone()),
        Answer::NoAnswer => None,
    }
}

/// Handles the option and "next" buttons under a question. A press on a
/// question the session already left is acknowledged and dropped.
async fn question_callback(bot: Bot, q: CallbackQuery, app: Arc<App>) -> HandlerResult {
    let action = q.data.as_deref().and_then(QuestionAction::decode);
    let chat_id = q.message.as_ref().map(|m| m.chat.id);
    let (Some(action), Some(chat_id)) = (action, chat_id) else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };
    let Some(handle) = app.session(chat_id).await else {
        bot.answer_callback_query(q.id)
            .text("This quiz session has expired.")
            .await?;
        return Ok(());
    };
    let mut live = handle.lock().await;

    let applied = live.session.apply(&action);
    match applied {
        Err(err) => {
            debug!("Dropped {:?} from {}: {}", action, chat_id, err);
            bot.answer_callback_query(q.id)
                .text("This question is closed.")
                .await?;
        }
        Ok(None) => {
            let toast = selected_text(&live.session)
                .map(|text| format!("Selected: {}", text))
                .unwrap_or_else(|| "Answer saved".to_string());
            bot.answer_callback_query(q.id).text(toast).await?;
        }
        Ok(Some(Step::Question(index))) => {
            bot.answer_callback_query(q.id).await?;
            start_countdown(&app, &bot, chat_id, &handle, &mut live);
            send_question(&bot, chat_id, &live.session, index).await?;
        }
        Ok(Some(Step::Finished)) => {
            bot.answer_callback_query(q.id).await?;
            live.countdown.stop();
            drop(live);
            notify(&bot, chat_id, "Submitting your answers...".to_string()).await;
            tokio::spawn(finish_session(app.clone(), bot.clone(), chat_id, handle.clone()));
        }
    }
    Ok(())
}

fn render_leaderboard(board: &Leaderboard, quiz_id: &str, filter: &str, order: SortOrder) -> String {
    if board.quiz().is_none() {
        return "Quiz not found!".to_string();
    }
    let mut lines = vec![
        format!("Quiz Leaderboard #{}", quiz_id),
        format!(
            "Questions: {} | Participants: {} | Status: {}",
            board.question_count(),
            board.participant_count(),
            if board.is_open() { "Open" } else { "Closed" }
        ),
    ];
    if !filter.trim().is_empty() {
        lines.push(format!("Filter: \"{}\"", filter.trim()));
    }
    lines.push(String::new());

    let entries = board.view(filter, order);
    if entries.is_empty() {
        lines.push("No participants yet.".to_string());
    }
    for entry in entries {
        lines.push(format!(
            "{}. {} - {}",
            entry.rank, entry.participant.participant_name, entry.participant.score
        ));
    }
    lines.join("\n")
}

async fn receive_leaderboard_code(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    wallet: Option<WalletAddress>,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let quiz_id = match msg.text().map(str::trim) {
        Some(MENU) => return go_to_menu(&bot, &dialogue, &app, wallet).await,
        Some(code) if !code.is_empty() => code.to_string(),
        _ => {
            bot.send_message(chat_id, "Please enter the quiz code").await?;
            return Ok(());
        }
    };

    let order = SortOrder::default();
    match app.api.leaderboard(&quiz_id).await {
        Ok(data) => {
            let board = Leaderboard::from(data);
            bot.send_message(chat_id, render_leaderboard(&board, &quiz_id, "", order))
                .reply_markup(leaderboard_keyboard())
                .await?;
            dialogue
                .update(State::BrowsingLeaderboard {
                    wallet,
                    quiz_id,
                    filter: String::new(),
                    order,
                })
                .await?;
        }
        Err(err) => {
            bot.send_message(chat_id, format!("Failed to fetch leaderboard data: {}", err))
                .await?;
        }
    }
    Ok(())
}

async fn browsing_leaderboard(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    app: Arc<App>,
    (wallet, quiz_id, mut filter, mut order): (Option<WalletAddress>, String, String, SortOrder),
) -> HandlerResult {
    let chat_id = msg.chat.id;
    match msg.text() {
        Some(MENU) => return go_to_menu(&bot, &dialogue, &app, wallet).await,
        Some(SORT_BY_NAME) => order = SortOrder::Name,
        Some(SORT_BY_SCORE) => order = SortOrder::Score,
        Some(CLEAR_FILTER) => filter.clear(),
        Some(search) => filter = search.to_string(),
        None => {}
    }

    match app.api.leaderboard(&quiz_id).await {
        Ok(data) => {
            let board = Leaderboard::from(data);
            bot.send_message(chat_id, render_leaderboard(&board, &quiz_id, &filter, order))
                .reply_markup(leaderboard_keyboard())
                .await?;
        }
        Err(err) => {
            bot.send_message(chat_id, format!("Failed to fetch leaderboard data: {}", err))
                .await?;
        }
    }
    dialogue
        .update(State::BrowsingLeaderboard {
            wallet,
            quiz_id,
            filter,
            order,
        })
        .await?;
    Ok(())
}
