use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use pcsc::{Context, ReaderState, State};
use tagseal::events::{self, Event, Publisher};
use tagseal::pcsc::Signal;
use tagseal::service::KeyService;
use tagseal::validator::Validator;
use tap::TapFallible;
use tracing::{debug, error, info, trace, trace_span, warn};

use crate::{config, connect, key_service, select_reader, show, Args};

const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Validates every card that's put on the reader, printing presence events
/// as JSON lines on stdout. Runs until killed.
pub fn watch(args: &Args) -> Result<ExitCode> {
    let span = trace_span!("watch");
    let _enter = span.enter();

    let ctx = Context::establish(pcsc::Scope::User)?;
    let name = select_reader(&ctx, &args.reader)?;
    let mut validator = Validator::new(key_service(args)?, config(args));

    let (publisher, subscriber) = events::channel();
    std::thread::spawn(move || {
        while let Some(event) = subscriber.recv() {
            match event.to_json() {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(%err, "Couldn't serialize event"),
            }
        }
    });

    info!(?name, "Waiting for cards");
    let mut states = [ReaderState::new(name.clone(), State::UNAWARE)];
    let mut last = State::empty();
    loop {
        match ctx.get_status_change(POLL_TIMEOUT, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(err) => {
                error!(%err, "Reader error");
                publisher.publish(Event::ReaderError);
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }

        let state = states[0].event_state() & (State::PRESENT | State::EMPTY);
        states[0].sync_current_state();
        if state == last {
            continue;
        }
        trace!(?state, "Reader state changed");
        last = state;

        if state.contains(State::PRESENT) {
            present(&ctx, &name, &mut validator, &publisher);
        } else if state.contains(State::EMPTY) {
            debug!("Card removed");
            publisher.publish(Event::CardAbsent);
        }
    }
}

/// A card arrived. Every presentation gets a fresh connection, so nothing
/// read off the previous card can leak into this one.
fn present<S: KeyService>(
    ctx: &Context,
    name: &std::ffi::CStr,
    validator: &mut Validator<S>,
    publisher: &Publisher,
) {
    let Some(mut rdr) = announce(connect(ctx, name), publisher) else {
        return;
    };

    let signal = match validator.validate_protected(&mut rdr) {
        Ok(v) => {
            show::tags(&v.tags);
            show::validation(&v, chrono::Utc::now());
            match v.is_authentic() {
                true => Signal::success(),
                false => Signal::failure(),
            }
        }
        Err(err) => {
            show::error(&err);
            Signal::failure()
        }
    };
    let _ = rdr
        .signal(signal)
        .tap_err(|err| debug!(%err, "Couldn't beep"));
}

/// Publishes the outcome of connecting to a freshly presented card. A card
/// that's there but can't be talked to is a reader error, not silence.
fn announce<T>(connected: Result<T>, publisher: &Publisher) -> Option<T> {
    match connected {
        Ok(card) => {
            publisher.publish(Event::CardPresent);
            Some(card)
        }
        Err(err) => {
            warn!(%err, "Couldn't connect to card");
            publisher.publish(Event::ReaderError);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_announce_connected() {
        let (publisher, subscriber) = events::channel();
        assert_eq!(announce(Ok(42), &publisher), Some(42));
        assert_eq!(subscriber.latest(), Some(Event::CardPresent));
    }

    #[test]
    fn test_announce_connect_failed() {
        let (publisher, subscriber) = events::channel();
        let res: Result<()> = Err(anyhow!("card reset"));
        assert_eq!(announce(res, &publisher), None);
        assert_eq!(subscriber.latest(), Some(Event::ReaderError));
    }
}
