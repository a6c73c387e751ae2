use std::io;

use tokio::io::{AsyncWriteExt, AsyncRead, AsyncWrite};

/// Copy bytes both ways between `a` and `b` until both directions have seen
/// end-of-stream, propagating each EOF to the other side as a write-half
/// shutdown.
///
/// Returns `(a_to_b, b_to_a)` byte totals. An error in either direction ends
/// the pump; dropping the halves closes whatever is still open.
pub async fn pump<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let n = tokio::io::copy(&mut a_read, &mut b_write).await?;
        // trigger an EOF on the other end
        b_write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let b_to_a = async {
        let n = tokio::io::copy(&mut b_read, &mut a_write).await?;
        a_write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };

    tokio::try_join!(a_to_b, b_to_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pump_copies_both_directions() {
        let (mut client, near) = tokio::io::duplex(64);
        let (far, mut server) = tokio::io::duplex(64);

        let task = tokio::spawn(pump(near, far));

        client.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        server.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        drop(server);
        let (a_to_b, b_to_a) = task.await.unwrap().unwrap();
        assert_eq!(a_to_b, 6);
        assert_eq!(b_to_a, 5);
    }

    #[tokio::test]
    async fn test_pump_preserves_order() {
        let (mut client, near) = tokio::io::duplex(16);
        let (far, mut server) = tokio::io::duplex(16);
        tokio::spawn(pump(near, far));

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let expected = payload.clone();
        tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        let (mut client, near) = tokio::io::duplex(64);
        let (far, mut server) = tokio::io::duplex(64);
        let task = tokio::spawn(pump(near, far));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // the server sees all bytes then EOF
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // and can still answer on the other direction
        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();

        let mut answer = Vec::new();
        client.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"response");

        let (sent, received) = task.await.unwrap().unwrap();
        assert_eq!(sent, 7);
        assert_eq!(received, 8);
    }
}
