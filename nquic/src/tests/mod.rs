use std::{
    io::{self, Write},
    str,
    time::Duration,
};

use rand::{rngs::StdRng, RngCore, SeedableRng};
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::EnvFilter;

use crate::{
    Configuration, Connection, Credential, CredentialFlags, ExecutionProfile, Registration,
    Settings, Stream, StreamOpenFlags, StreamStartFlags,
};

mod loopback;
mod stream;

use sim::{sim, Sim, MANUAL_PORT};

const ALPN: &[u8] = b"sim";

fn registration() -> Registration {
    sim();
    Registration::new("nquic-tests", ExecutionProfile::LowLatency).unwrap()
}

fn configuration(
    registration: &Registration,
    settings: Settings,
    flags: CredentialFlags,
) -> Configuration {
    let config = Configuration::new(registration, &[ALPN], settings).unwrap();
    config.load_credential(&Credential::None, flags).unwrap();
    config
}

fn client_configuration(registration: &Registration) -> Configuration {
    configuration(registration, Settings::default(), CredentialFlags::CLIENT)
}

/// A connection to the manual peer, already connected
async fn manual_connection(settings: Settings) -> (Connection, &'static Sim) {
    let registration = registration();
    let config = configuration(&registration, settings, CredentialFlags::CLIENT);
    let conn = Connection::new(&registration).unwrap();
    conn.start(&config, "localhost", MANUAL_PORT).await.unwrap();
    (conn, sim())
}

/// A started stream on a manual connection
async fn manual_stream(conn: &Connection) -> Stream {
    let stream = conn.open_stream(StreamOpenFlags::NONE).unwrap();
    stream.start(StreamStartFlags::NONE).await.unwrap();
    stream
}

fn unbuffered(bootstrap: u64) -> Settings {
    let mut settings = Settings::default();
    settings.send_buffering_enabled(false).send_window_bootstrap(bootstrap);
    settings
}

/// Poll `cond` until it holds, giving callbacks and spawned tasks time to run
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never reached");
}

fn gen_data(size: usize, seed: u64) -> Vec<u8> {
    let mut rng: StdRng = SeedableRng::seed_from_u64(seed);
    let mut buf = vec![0; size];
    rng.fill_bytes(&mut buf);
    buf
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

fn rt_threaded() -> Runtime {
    Builder::new_multi_thread().enable_all().build().unwrap()
}
