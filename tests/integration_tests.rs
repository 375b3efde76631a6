//! Integration Tests for Voltage Modbus Bridge
//!
//! Server and client talking over real localhost sockets through the tokio
//! stack, plus scripted scenarios over the loopback stack.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, timeout};
use voltage_modbus_bridge::mbap::TransactionCounter;
use voltage_modbus_bridge::stack::PeerHandle;
use voltage_modbus_bridge::*;

fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

/// Start a server on an ephemeral port and return it with its address
async fn start_server(config: ServerConfig) -> Result<(ModbusTcpServer, WriteListener, SocketAddr)> {
    let stack = Arc::new(TokioStack::current()?);
    let (mut server, listener) = ModbusTcpServer::new(stack, config)?;
    server.start().await?;
    let port = server
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("server has no local address"))?
        .port();
    Ok((server, listener, SocketAddr::from(([127, 0, 0, 1], port))))
}

async fn connect_client(address: SocketAddr) -> Result<ModbusTcpClient> {
    let stack = Arc::new(TokioStack::current()?);
    Ok(ModbusTcpClient::connect_with(stack, ClientConfig::new(address)).await?)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> Result<()> {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_write_single_register_end_to_end() -> Result<()> {
    let (mut server, mut writes, address) = start_server(server_config()).await?;
    let mut client = connect_client(address).await?;

    client.write_06(1, 4, 1234).await?;

    let notification = timeout(Duration::from_secs(1), writes.consume())
        .await?
        .ok_or_else(|| anyhow::anyhow!("channel closed"))?;
    assert_eq!(
        notification,
        WriteNotification {
            function: ModbusFunction::WriteSingleRegister,
            address: 4,
            count: 1,
        }
    );
    assert_eq!(server.get_mapping().lock()?.get_holding_register(4)?, 1234);
    assert_eq!(client.read_03(1, 4, 1).await?, vec![1234]);

    client.close().await?;
    server.stop().await?;
    assert!(!server.is_running());
    Ok(())
}

#[tokio::test]
async fn test_all_function_codes() -> Result<()> {
    let (server, writes, address) = start_server(server_config()).await?;
    {
        let mapping = server.get_mapping();
        let mut guard = mapping.lock()?;
        guard.set_discrete_inputs(0, &[true, false, true])?;
        guard.set_input_registers(10, &[0xAAAA, 0x5555])?;
    }
    let mut client = connect_client(address).await?;

    // keep the single-slot channel empty so writes are not held back
    let drain = tokio::spawn(async move {
        let mut writes = writes;
        while writes.consume().await.is_some() {}
    });

    client.write_05(1, 7, true).await?;
    assert_eq!(client.read_01(1, 6, 3).await?, vec![false, true, false]);
    assert_eq!(client.read_02(1, 0, 3).await?, vec![true, false, true]);
    assert_eq!(client.read_04(1, 10, 2).await?, vec![0xAAAA, 0x5555]);

    client.write_0f(1, 20, &[true, true, false, true]).await?;
    assert_eq!(client.read_01(1, 20, 4).await?, vec![true, true, false, true]);

    client.write_10(1, 30, &[1, 2, 3]).await?;
    assert_eq!(client.read_03(1, 30, 3).await?, vec![1, 2, 3]);

    // counted after the response went out
    wait_for(|| server.get_stats().successful_requests == 8).await?;
    assert_eq!(server.get_stats().exception_responses, 0);

    drop(server);
    drop(drain);
    Ok(())
}

#[tokio::test]
async fn test_write_and_read_registers() -> Result<()> {
    let (server, mut writes, address) = start_server(server_config()).await?;
    server.get_mapping().lock()?.set_holding_registers(0, &[1, 2])?;
    let mut client = connect_client(address).await?;

    let read = client.write_read_17(1, 0, 2, 0, &[5, 6]).await?;
    assert_eq!(read, vec![5, 6]);
    assert_eq!(server.get_mapping().lock()?.get_holding_registers(0, 2)?, vec![5, 6]);

    let notification = timeout(Duration::from_secs(1), writes.consume()).await?;
    assert_eq!(
        notification,
        Some(WriteNotification {
            function: ModbusFunction::WriteAndReadRegisters,
            address: 0,
            count: 2,
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_range_fault_boundary() -> Result<()> {
    let (server, mut writes, address) = start_server(server_config()).await?;
    let mut client = connect_client(address).await?;

    // default tables hold addresses 0..100
    assert_eq!(client.read_03(1, 99, 1).await?.len(), 1);

    for (start, quantity) in [(99, 2), (100, 1)] {
        match client.read_03(1, start, quantity).await {
            Err(ModbusError::Exception { function, code, .. }) => {
                assert_eq!((function, code), (0x03, 0x02));
            }
            other => panic!("expected illegal data address, got {:?}", other),
        }
    }

    // a rejected write leaves the mapping untouched and publishes nothing
    assert!(client.write_10(1, 98, &[7, 7, 7]).await.is_err());
    assert_eq!(server.get_mapping().lock()?.get_holding_registers(98, 2)?, vec![0, 0]);
    assert_eq!(writes.try_consume(), None);

    // the connection survives range faults
    assert!(client.is_connected());
    assert_eq!(server.get_stats().exception_responses, 3);
    Ok(())
}

#[tokio::test]
async fn test_notifications_follow_commit_order() -> Result<()> {
    let (server, mut writes, address) = start_server(server_config()).await?;
    let mapping = server.get_mapping();
    let mut client = connect_client(address).await?;

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 20 {
            let Some(notification) = writes.consume().await else { break };
            // the write is visible by the time it is announced
            let value = mapping.lock().and_then(|g| g.get_holding_register(notification.address));
            seen.push((notification.address, value.ok()));
        }
        seen
    });

    for address in 0..20u16 {
        client.write_06(1, address, address + 100).await?;
    }

    let seen = timeout(Duration::from_secs(2), consumer).await??;
    let expected: Vec<_> = (0..20u16).map(|a| (a, Some(a + 100))).collect();
    assert_eq!(seen, expected);
    wait_for(|| server.get_stats().notifications_published == 20).await?;
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_disconnect() -> Result<()> {
    let (server, _writes, address) = start_server(server_config()).await?;

    let mut first = connect_client(address).await?;
    assert_eq!(first.read_03(1, 0, 1).await?, vec![0]);
    first.close().await?;
    wait_for(|| !server.is_connected()).await?;

    let mut second = connect_client(address).await?;
    assert_eq!(second.read_03(1, 0, 2).await?, vec![0, 0]);
    assert_eq!(server.get_stats().connections_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_unit_filter_times_out_other_units() -> Result<()> {
    let config = ServerConfig {
        unit_id: Some(1),
        ..server_config()
    };
    let (server, _writes, address) = start_server(config).await?;
    let stack = Arc::new(TokioStack::current()?);
    let mut client = ModbusTcpClient::connect_with(
        stack,
        ClientConfig {
            response_timeout_ms: 100,
            ..ClientConfig::new(address)
        },
    )
    .await?;

    assert!(matches!(client.read_03(2, 0, 1).await, Err(ModbusError::Timeout { .. })));
    assert_eq!(client.read_03(1, 0, 1).await?, vec![0]);
    assert_eq!(client.read_03(TCP_SLAVE, 0, 1).await?, vec![0]);
    assert_eq!(server.get_stats().ignored_requests, 1);
    Ok(())
}

#[tokio::test]
async fn test_transaction_ids_increase_and_wrap() -> Result<()> {
    let (_server, _writes, address) = start_server(server_config()).await?;
    let mut client = connect_client(address).await?;

    let mut previous = client.last_transaction_id();
    for _ in 0..10 {
        client.read_04(1, 0, 1).await?;
        let current = client.last_transaction_id();
        assert_eq!(current, previous.wrapping_add(1));
        previous = current;
    }

    let counter = TransactionCounter::starting_after(u16::MAX - 1);
    assert_eq!(counter.next(), u16::MAX);
    assert_eq!(counter.next(), 0);
    assert_eq!(counter.next(), 1);
    Ok(())
}

#[tokio::test]
async fn test_random_register_traffic() -> Result<()> {
    let (server, writes, address) = start_server(server_config()).await?;
    let mut client = connect_client(address).await?;
    let drain = tokio::spawn(async move {
        let mut writes = writes;
        while writes.consume().await.is_some() {}
    });

    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut shadow = vec![0u16; 100];
    for _ in 0..200 {
        let start: u16 = rng.gen_range(0..100);
        let quantity: u16 = rng.gen_range(1..=(100 - start).min(20));
        if rng.gen_bool(0.5) {
            let values: Vec<u16> = (0..quantity).map(|_| rng.gen()).collect();
            client.write_10(1, start, &values).await?;
            shadow[usize::from(start)..usize::from(start + quantity)].copy_from_slice(&values);
        } else {
            let read = client.read_03(1, start, quantity).await?;
            assert_eq!(read, shadow[usize::from(start)..usize::from(start + quantity)]);
        }
    }

    assert_eq!(server.get_mapping().lock()?.get_holding_registers(0, 100)?, shadow);
    drop(server);
    drop(drain);
    Ok(())
}

#[tokio::test]
async fn test_debug_toggle_at_runtime() -> Result<()> {
    logging::init_test_logger();
    let (server, _writes, address) = start_server(server_config()).await?;
    let mut client = connect_client(address).await?;

    assert!(!server.debug());
    server.set_debug(true);
    client.set_debug(true);
    assert!(server.debug() && client.debug());
    assert_eq!(client.read_03(1, 0, 2).await?, vec![0, 0]);

    server.set_debug(false);
    client.set_debug(false);
    assert_eq!(client.read_03(1, 0, 2).await?, vec![0, 0]);
    Ok(())
}

#[tokio::test]
async fn test_server_from_yaml_layout() -> Result<()> {
    let config = ServerConfig::from_yaml_str(
        r#"
port: 0
mapping:
  holding_registers: { start_address: 1000, size: 10 }
"#,
    )?;
    let (_server, _writes, address) = start_server(config).await?;
    let mut client = connect_client(address).await?;

    client.write_06(1, 1009, 42).await?;
    assert_eq!(client.read_03(1, 1009, 1).await?, vec![42]);
    assert!(matches!(
        client.read_03(1, 0, 1).await,
        Err(ModbusError::Exception { code: 0x02, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_receive_with_zero_deadline_times_out() -> Result<()> {
    let stack = LoopbackStack::new();
    let bridge = TcpBridge::new(Arc::new(stack.clone()), "127.0.0.1:502".parse()?, OverflowPolicy::Disconnect);
    bridge.connect().await?;

    let mut buf = [0u8; 16];
    match bridge.receive(&mut buf, Some(Duration::ZERO)).await {
        Err(ModbusError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 0),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(bridge.is_connected());
    assert_eq!(bridge.stats().timeouts, 1);
    Ok(())
}

#[tokio::test]
async fn test_oversized_segment_disconnects() -> Result<()> {
    let stack = LoopbackStack::new();
    let bridge = TcpBridge::new(Arc::new(stack.clone()), "0.0.0.0:502".parse()?, OverflowPolicy::Disconnect);
    bridge.listen(1)?;
    let peer: PeerHandle = stack
        .remote_connect()
        .ok_or_else(|| anyhow::anyhow!("listener missing"))?;
    bridge.accept().await?;

    stack.remote_send(peer, &[0u8; 300]);
    let mut buf = [0u8; 300];
    assert!(matches!(
        bridge.receive(&mut buf, Some(Duration::from_millis(10))).await,
        Err(ModbusError::BufferOverflow { .. })
    ));
    assert!(!bridge.is_connected());
    assert!(stack.is_closed(peer));
    Ok(())
}
