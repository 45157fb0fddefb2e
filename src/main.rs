use std::io::Read;

use tracing::{error, info, warn};
use voicelink::{
    VoiceClient, VoiceEvent,
    common::{logger, types::AnyResult},
    configs::Config,
    gateway::SessionParams,
};

/// Streams raw 48 kHz stereo s16le PCM from stdin into a voice channel,
/// e.g. `ffmpeg -i song.mp3 -f s16le -ar 48000 -ac 2 - | voicelink`.
#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);

    let Some(session) = config.session.clone() else {
        return Err("[session] section is required to connect".into());
    };
    let params = SessionParams::from(session);

    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let client = VoiceClient::new(config.voice.clone(), events_tx);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                VoiceEvent::UserSpeaking { user_id, speaking } => {
                    info!("User {} speaking: {}", user_id, speaking);
                }
                VoiceEvent::PacketReceived {
                    user_id, length, ..
                } => {
                    tracing::trace!("{} bytes of audio from {}", length, user_id);
                }
                VoiceEvent::ConnectionLost { reason } => {
                    warn!("Connection lost: {}", reason);
                }
            }
        }
    });

    info!(
        "Connecting to guild {} via {}",
        params.guild_id, params.endpoint
    );
    client.connect(params).await?;
    info!("Connected; streaming PCM from stdin");

    // A plain thread: a blocked stdin read must not keep the process alive.
    let (done_tx, done_rx) = flume::bounded(1);
    let pump_client = client.clone();
    std::thread::Builder::new()
        .name("pcm-pump".into())
        .spawn(move || {
            let _ = done_tx.send(pump_stdin(&pump_client));
        })?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        result = done_rx.recv_async() => match result {
            Ok(Ok(())) => info!("Input finished"),
            Ok(Err(e)) => error!("Streaming stopped: {}", e),
            Err(_) => error!("PCM pump exited unexpectedly"),
        },
    }

    client.disconnect().await;
    Ok(())
}

fn pump_stdin(client: &VoiceClient) -> AnyResult<()> {
    let mut stdin = std::io::stdin().lock();
    let mut chunk = vec![0u8; client.config().frame_size_bytes()];
    loop {
        let n = stdin.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        client.push_pcm(&chunk[..n])?;
    }
    client.wait()?;
    Ok(())
}
