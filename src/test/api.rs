#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::{Value, json};

    use crate::api::{AttendanceResponse, RosterResponse};
    use crate::models::{AttendanceStatus, RosterEntry};
    use crate::store::BulkUpsert;
    use crate::test::test_utils::{date, setup_test_client, standard_sheets};
    use crate::validation::ValidationResponse;

    async fn put_attendance(client: &Client, body: Value) -> (Status, String) {
        let response = client
            .put("/api/attendance")
            .header(ContentType::JSON)
            .body(body.to_string())
            .dispatch()
            .await;

        let status = response.status();
        (status, response.into_string().await.unwrap_or_default())
    }

    #[rocket::async_test]
    async fn test_health() {
        let (client, _) = setup_test_client(standard_sheets()).await;

        let response = client.get("/api/health").dispatch().await;

        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "OK");
    }

    #[rocket::async_test]
    async fn test_roster_list_and_add() {
        let (client, sheets) = setup_test_client(standard_sheets()).await;

        let response = client
            .post("/api/roster")
            .header(ContentType::JSON)
            .body(json!({ "name": " Dana Evans " }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let entry: RosterEntry =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(entry.subject_name, "Dana Evans");

        let response = client.get("/api/roster").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let roster: RosterResponse =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(roster.group_id, "IT-21");
        assert_eq!(
            roster.subjects,
            vec!["Alice Brown", "Boris Chen", "Carla Diaz", "Dana Evans"]
        );
        assert_eq!(sheets.rows(crate::sheets::Sheet::Roster).await.len(), 4);
    }

    #[rocket::async_test]
    async fn test_add_subject_validation() {
        let (client, _) = setup_test_client(standard_sheets()).await;

        let response = client
            .post("/api/roster")
            .header(ContentType::JSON)
            .body(json!({ "name": "" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
        let body: ValidationResponse =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body.status, "error");
        assert!(body.errors.contains_key("name"));

        let response = client
            .post("/api/roster")
            .header(ContentType::JSON)
            .body(json!({ "name": "Boris Chen" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
        let body: ValidationResponse =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert!(body.errors.contains_key("validation"));
    }

    #[rocket::async_test]
    async fn test_upsert_then_read_attendance() {
        let (client, sheets) = setup_test_client(standard_sheets()).await;

        let (status, body) = put_attendance(
            &client,
            json!({
                "date": "04.03.2024",
                "slots": [1, 2],
                "subjects": ["Alice Brown", "Boris Chen"],
                "status": "sick",
                "reason": "flu"
            }),
        )
        .await;
        assert_eq!(status, Status::Ok);
        let outcome: BulkUpsert = serde_json::from_str(&body).unwrap();
        assert_eq!(
            outcome,
            BulkUpsert::Complete {
                records: 4,
                subjects: 2
            }
        );
        assert_eq!(sheets.records().await.len(), 4);

        let response = client
            .get("/api/attendance?date=04.03.2024&slot=2")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let attendance: AttendanceResponse =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();

        assert_eq!(attendance.date, "04.03.2024");
        assert_eq!(attendance.time_range.as_deref(), Some("09:40 - 11:10"));
        assert_eq!(attendance.marks.len(), 2);
        assert_eq!(attendance.marks["Alice Brown"].status, AttendanceStatus::Sick);
        assert_eq!(
            attendance.marks["Boris Chen"].reason.as_deref(),
            Some("flu")
        );
    }

    #[rocket::async_test]
    async fn test_upsert_rejections() {
        let (client, sheets) = setup_test_client(standard_sheets()).await;

        let (status, body) = put_attendance(
            &client,
            json!({
                "date": "04.03.2024",
                "slots": [1],
                "subjects": ["Alice Brown"],
                "status": "sick"
            }),
        )
        .await;
        assert_eq!(status, Status::UnprocessableEntity);
        assert!(body.contains("validation"));

        let (status, body) = put_attendance(
            &client,
            json!({
                "date": "04.03.2024",
                "slots": [1],
                "subjects": ["Nobody Known"],
                "status": "present"
            }),
        )
        .await;
        assert_eq!(status, Status::NotFound);
        assert!(body.contains("Nobody Known"));

        let (status, _) = put_attendance(
            &client,
            json!({
                "date": "04.03.2024",
                "slots": [9],
                "subjects": ["Alice Brown"],
                "status": "present"
            }),
        )
        .await;
        assert_eq!(status, Status::UnprocessableEntity);

        let (status, _) = put_attendance(
            &client,
            json!({
                "date": "2024-03-04",
                "slots": [1],
                "subjects": ["Alice Brown"],
                "status": "present"
            }),
        )
        .await;
        assert_eq!(status, Status::UnprocessableEntity);

        let (status, body) = put_attendance(
            &client,
            json!({
                "date": "04.03.2024",
                "slots": [],
                "subjects": ["Alice Brown"],
                "status": "present"
            }),
        )
        .await;
        assert_eq!(status, Status::UnprocessableEntity);
        let body: ValidationResponse = serde_json::from_str(&body).unwrap();
        assert!(body.errors.contains_key("slots"));

        assert!(sheets.records().await.is_empty());
    }

    #[rocket::async_test]
    async fn test_get_attendance_rejects_unknown_slot() {
        let (client, _) = setup_test_client(standard_sheets()).await;

        let response = client
            .get("/api/attendance?date=04.03.2024&slot=7")
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_operator_actions_drive_a_session() {
        let (client, sheets) = setup_test_client(standard_sheets()).await;

        for action in [
            json!({ "type": "set_date", "date": "04.03.2024" }),
            json!({ "type": "toggle_slot", "slot": 1 }),
        ] {
            let response = client
                .post("/api/operators/42/actions")
                .header(ContentType::JSON)
                .body(action.to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Ok);
        }

        let response = client
            .post("/api/operators/42/actions")
            .header(ContentType::JSON)
            .body(json!({ "type": "start_marking" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let view: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(view["phase"], "marking");
        assert_eq!(view["date"], "04.03.2024");
        assert_eq!(view["marking"]["rows"].as_array().unwrap().len(), 3);

        let response = client
            .post("/api/operators/42/actions")
            .header(ContentType::JSON)
            .body(json!({ "type": "apply_to_all", "status": "present" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let view: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(view["saved"]["outcome"], "complete");
        assert_eq!(sheets.records().await.len(), 3);
    }

    #[rocket::async_test]
    async fn test_unknown_action_is_rejected() {
        let (client, _) = setup_test_client(standard_sheets()).await;

        let response = client
            .post("/api/operators/42/actions")
            .header(ContentType::JSON)
            .body(json!({ "type": "launch_rockets" }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_monthly_report_endpoint() {
        let builder = standard_sheets()
            .record(date(4, 3, 2024), 1, "Alice Brown", AttendanceStatus::Present, None)
            .record(
                date(4, 3, 2024),
                1,
                "Boris Chen",
                AttendanceStatus::Sick,
                Some("flu"),
            );
        let (client, _) = setup_test_client(builder).await;

        let response = client
            .get("/api/reports/monthly?month=03.2024")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let report: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(report["file_name"], "attendance_IT-21_03.2024.xlsx");
        assert_eq!(report["summary"]["records"], 2);

        let response = client
            .get("/api/reports/monthly?month=05.2024")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);

        let response = client
            .get("/api/reports/monthly?month=13.2024")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_exhausted_quota_maps_to_too_many_requests() {
        let (client, sheets) = setup_test_client(standard_sheets()).await;
        sheets.quota_errors(10);

        let response = client.get("/api/roster").dispatch().await;

        assert_eq!(response.status(), Status::TooManyRequests);
        let body: ValidationResponse =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert!(body.errors.contains_key("sheet"));
    }
}
