use crate::infra::LogNotifier;
use crate::sweep::render_sweep_report;
use chrono::{Duration, NaiveDate, Utc};
use clap::Args;
use std::sync::Arc;
use transport_enrollment::config::EnrollmentConfig;
use transport_enrollment::enrollment::{
    Aggregate, EnrollmentService, FixedClock, InMemoryEntityStore, Principal, StudentEntry,
    StudentFields, StudentRef, SubmissionForm, TutorEntry, TutorFields,
};
use transport_enrollment::error::AppError;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Days to fast-forward before sweeping
    #[arg(long, default_value_t = 40)]
    pub(crate) elapsed_days: u32,
    /// Retention window used by the sweep
    #[arg(long, default_value_t = 30)]
    pub(crate) retention_days: u32,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        elapsed_days,
        retention_days,
    } = args;

    let clock = Arc::new(FixedClock::new(Utc::now()));
    let service = EnrollmentService::with_clock(
        Arc::new(InMemoryEntityStore::default()),
        Arc::new(LogNotifier),
        &EnrollmentConfig::default(),
        clock.clone(),
    );

    let maria = Principal::guardian("maria", Some("maria@example.com"));
    let jorge = Principal::guardian("jorge", Some("jorge@example.com"));
    let office = Principal::admin("office");

    println!("Transport enrollment demo");

    let submitted = service
        .submit_form(&maria, demo_form("0912345678", "Ana", "Luis"))
        .await?;
    println!("\nmaria submits a form");
    render_aggregate(&submitted.aggregate);

    let again = service
        .submit_form(&maria, demo_form("0912345678", "Ana", "Luis"))
        .await?;
    println!(
        "\nmaria re-submits the same form: {} student(s), {} tutor(s), changes {:?}",
        again.aggregate.students.len(),
        again.aggregate.tutors.len(),
        again.summary
    );

    let jorge_form = service
        .submit_form(&jorge, demo_form("1700000001", "Sofia", "Marta"))
        .await?;
    let decision = service
        .decide_approval(&office, jorge_form.aggregate.guardian.id, true)
        .await?;
    println!(
        "\noffice decides jorge's form: {} -> {}",
        decision.transition.from.label(),
        decision.transition.to.label()
    );

    clock.advance(Duration::days(i64::from(elapsed_days)));
    println!("\n{elapsed_days} days later");
    let retention = Duration::days(i64::from(retention_days));
    let preview = service.sweep_expired(retention, true).await?;
    render_sweep_report(&preview);
    let report = service.sweep_expired(retention, false).await?;
    render_sweep_report(&report);

    let remaining = service
        .list_submissions(&office, Default::default())
        .await?;
    println!("\nForms on file: {}", remaining.len());
    for aggregate in &remaining {
        render_aggregate(aggregate);
    }

    Ok(())
}

fn demo_form(national_id: &str, student: &str, tutor: &str) -> SubmissionForm {
    SubmissionForm {
        national_id: national_id.to_string(),
        phone: Some("0991234567".to_string()),
        students: vec![StudentEntry::New(StudentFields {
            name: student.to_string(),
            surname: "Paredes".to_string(),
            birth_date: NaiveDate::from_ymd_opt(2016, 5, 14).unwrap_or_default(),
            grade: "3".to_string(),
            age: Some(8),
            school: Some("Escuela Central".to_string()),
            entry_time: None,
            exit_time: None,
        })],
        tutors: vec![TutorEntry::New {
            student: StudentRef::Position(0),
            fields: TutorFields {
                name: tutor.to_string(),
                surname: "Paredes".to_string(),
                address: None,
                phone: None,
                relationship: Some("uncle".to_string()),
            },
        }],
    }
}

fn render_aggregate(aggregate: &Aggregate) {
    let guardian = &aggregate.guardian;
    println!(
        "- guardian {} ({}) national id {} | {}",
        guardian.id,
        guardian.identity,
        guardian.national_id,
        guardian.approval.label()
    );
    for student in &aggregate.students {
        println!(
            "  - student {} {} {} (grade {})",
            student.id, student.fields.name, student.fields.surname, student.fields.grade
        );
        for tutor in aggregate.tutors_of(student.id) {
            println!(
                "    - tutor {} {} {}",
                tutor.id, tutor.fields.name, tutor.fields.surname
            );
        }
    }
}
