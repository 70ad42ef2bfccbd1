use std::sync::Arc;
use std::time::Duration;
use voicepanel::turn_manager::{create_turn_manager, InMemoryTurnManager, TurnManager};

#[tokio::test]
async fn test_concurrent_acquirers_yield_one_owner() {
    let turns: Arc<dyn TurnManager> = Arc::new(InMemoryTurnManager::new());

    let mut handles = Vec::new();
    for agent in ["Mark", "Kevin", "Lori", "Robert", "Barbara", "Daymond"] {
        let turns = Arc::clone(&turns);
        handles.push(tokio::spawn(async move {
            let won = turns
                .try_acquire("pitch-42", agent, Duration::from_secs(30))
                .await
                .unwrap();
            (agent, won)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (agent, won) = handle.await.unwrap();
        if won {
            winners.push(agent);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(
        turns.get_current("pitch-42").await.unwrap().as_deref(),
        Some(winners[0])
    );
}

#[tokio::test(start_paused = true)]
async fn test_expired_claim_is_taken_over() {
    let turns = InMemoryTurnManager::new();
    assert!(turns
        .try_acquire("pitch-42", "Mark", Duration::from_secs(30))
        .await
        .unwrap());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(turns
        .try_acquire("pitch-42", "Kevin", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(!turns.release("pitch-42", "Mark").await.unwrap());
    assert_eq!(
        turns.get_current("pitch-42").await.unwrap().as_deref(),
        Some("Kevin")
    );
}

#[tokio::test]
async fn test_rooms_hold_independent_claims() {
    let turns = create_turn_manager(None).await.unwrap();
    assert_eq!(turns.backend_name(), "memory");

    let ttl = Duration::from_secs(5);
    assert!(turns.try_acquire("room-a", "Mark", ttl).await.unwrap());
    assert!(turns.try_acquire("room-b", "Kevin", ttl).await.unwrap());
    assert!(turns.release("room-a", "Mark").await.unwrap());
    assert_eq!(turns.get_current("room-a").await.unwrap(), None);
    assert_eq!(
        turns.get_current("room-b").await.unwrap().as_deref(),
        Some("Kevin")
    );
}
